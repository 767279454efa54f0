//! Profile and credential types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::services::storage::backends::{
    FtpConfig, GcsConfig, LocalConfig, S3Config, SftpConfig, SmbConfig,
};
use crate::services::storage::{OperationError, ProviderKind};

/// Keyring service under which profile secrets are stored.
pub const CREDENTIAL_SERVICE: &str = "stowage";

/// Id of the built-in local profile.
pub const DEFAULT_LOCAL_ID: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    Required,
    InvalidFormat,
    DuplicateId,
    DuplicateName,
    TypeMismatch,
    DefaultLocalProtected,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::Required => "required",
            ValidationCode::InvalidFormat => "invalid_format",
            ValidationCode::DuplicateId => "duplicate_id",
            ValidationCode::DuplicateName => "duplicate_name",
            ValidationCode::TypeMismatch => "type_mismatch",
            ValidationCode::DefaultLocalProtected => "default_local_protected",
        }
    }
}

/// A rejected profile, naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub code: ValidationCode,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: ValidationCode, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn required(field: &str) -> Self {
        Self::new(ValidationCode::Required, field, "is required")
    }
}

impl From<ValidationError> for OperationError {
    fn from(e: ValidationError) -> Self {
        OperationError::invalid_input(e.to_string()).with_code(e.code.as_str())
    }
}

fn require(value: &str, field: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::required(field))
    } else {
        Ok(())
    }
}

fn check_endpoint(endpoint: Option<&str>) -> Result<(), ValidationError> {
    match endpoint.filter(|e| !e.is_empty()) {
        Some(e) => url::Url::parse(e).map(|_| ()).map_err(|err| {
            ValidationError::new(ValidationCode::InvalidFormat, "config.endpoint", err.to_string())
        }),
        None => Ok(()),
    }
}

fn check_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        Err(ValidationError::new(
            ValidationCode::InvalidFormat,
            "config.port",
            "must be between 1 and 65535",
        ))
    } else {
        Ok(())
    }
}

/// Backend-specific connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Sftp(SftpConfig),
    Ftp(FtpConfig),
    Smb(SmbConfig),
    Local(LocalConfig),
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::S3(_) => ProviderKind::S3,
            ProviderConfig::Gcs(_) => ProviderKind::Gcs,
            ProviderConfig::Sftp(_) => ProviderKind::Sftp,
            ProviderConfig::Ftp(_) => ProviderKind::Ftp,
            ProviderConfig::Smb(_) => ProviderKind::Smb,
            ProviderConfig::Local(_) => ProviderKind::Local,
        }
    }

    /// Check the fields this backend needs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ProviderConfig::S3(c) => {
                require(&c.bucket, "config.bucket")?;
                check_endpoint(c.endpoint.as_deref())
            }
            ProviderConfig::Gcs(c) => {
                require(&c.bucket, "config.bucket")?;
                check_endpoint(c.endpoint.as_deref())
            }
            ProviderConfig::Sftp(c) => {
                require(&c.host, "config.host")?;
                require(&c.username, "config.username")?;
                check_port(c.port)
            }
            ProviderConfig::Ftp(c) => {
                require(&c.host, "config.host")?;
                check_port(c.port)
            }
            ProviderConfig::Smb(c) => {
                require(&c.host, "config.host")?;
                require(&c.share, "config.share")?;
                if c.mount_point.as_os_str().is_empty() {
                    return Err(ValidationError::required("config.mountPoint"));
                }
                Ok(())
            }
            ProviderConfig::Local(c) => {
                if c.root.as_os_str().is_empty() {
                    return Err(ValidationError::required("config.root"));
                }
                if !c.root.is_absolute() {
                    return Err(ValidationError::new(
                        ValidationCode::InvalidFormat,
                        "config.root",
                        "must be an absolute path",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Where a profile's secret lives in the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialRef {
    pub service: String,
    pub account: String,
}

impl CredentialRef {
    pub fn for_profile(profile_id: &str) -> Self {
        Self {
            service: CREDENTIAL_SERVICE.to_string(),
            account: profile_id.to_string(),
        }
    }
}

/// Resolved secrets handed to a backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    AccessKey {
        access_key_id: String,
        secret_access_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    Password {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        password: String,
    },
    PrivateKey {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    ServiceAccount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        json: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    Anonymous,
}

impl Credentials {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Credentials::AccessKey { .. } => "access key",
            Credentials::Password { .. } => "password",
            Credentials::PrivateKey { .. } => "private key",
            Credentials::ServiceAccount { .. } => "service account",
            Credentials::Anonymous => "anonymous",
        }
    }
}

/// Secrets never reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::AccessKey { access_key_id, .. } => f
                .debug_struct("AccessKey")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &"<redacted>")
                .finish(),
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Credentials::ServiceAccount { json, path } => f
                .debug_struct("ServiceAccount")
                .field("json", &json.as_ref().map(|_| "<redacted>"))
                .field("path", path)
                .finish(),
            Credentials::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// A named connection profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub config: ProviderConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
    #[serde(default)]
    pub default_local: bool,
}

impl Profile {
    /// Create a profile with a fresh id.
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            provider: config.kind(),
            config,
            credential: None,
            default_local: false,
        }
    }

    /// The built-in profile for the local filesystem.
    pub fn default_local(root: PathBuf) -> Self {
        Self {
            id: DEFAULT_LOCAL_ID.to_string(),
            name: "Local".to_string(),
            provider: ProviderKind::Local,
            config: ProviderConfig::Local(LocalConfig { root }),
            credential: None,
            default_local: true,
        }
    }

    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Shape checks that need only this profile.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require(&self.id, "id")?;
        require(&self.name, "name")?;
        if self.provider != self.config.kind() {
            return Err(ValidationError::new(
                ValidationCode::TypeMismatch,
                "config",
                format!(
                    "{} configuration given for a {} profile",
                    self.config.kind().as_str(),
                    self.provider.as_str()
                ),
            ));
        }
        if self.default_local && self.provider != ProviderKind::Local {
            return Err(ValidationError::new(
                ValidationCode::TypeMismatch,
                "defaultLocal",
                "only a local profile can be the default local profile",
            ));
        }
        self.config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_json_shape() {
        let profile = Profile::new("Archive", ProviderConfig::S3(S3Config::new("logs", "eu-west-1")))
            .with_credential(CredentialRef::for_profile("p1"));
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["provider"], "s3");
        assert_eq!(json["config"]["type"], "s3");
        assert_eq!(json["config"]["bucket"], "logs");
        assert_eq!(json["credential"]["service"], "stowage");

        let back: Profile = serde_json::from_value(json).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let mut profile = Profile::new("x", ProviderConfig::Ftp(FtpConfig::new("ftp.example.com")));
        profile.provider = ProviderKind::Sftp;
        let err = profile.validate().unwrap_err();
        assert_eq!(err.code, ValidationCode::TypeMismatch);
        assert_eq!(err.field, "config");
    }

    #[test]
    fn test_config_field_errors() {
        let err = ProviderConfig::Sftp(SftpConfig::new("host", "")).validate().unwrap_err();
        assert_eq!(err.code, ValidationCode::Required);
        assert_eq!(err.field, "config.username");

        let mut s3 = S3Config::new("b", "us-east-1");
        s3.endpoint = Some("not a url".into());
        let err = ProviderConfig::S3(s3).validate().unwrap_err();
        assert_eq!(err.code, ValidationCode::InvalidFormat);

        let relative = ProviderConfig::Local(LocalConfig {
            root: PathBuf::from("data"),
        });
        assert_eq!(relative.validate().unwrap_err().field, "config.root");
    }

    #[test]
    fn test_validation_error_maps_to_invalid_input() {
        let err = OperationError::from(ValidationError::required("name"));
        assert_eq!(err.code(), "required");
        assert_eq!(err.message(), "name: is required");
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let credentials = Credentials::AccessKey {
            access_key_id: "AKIA123".into(),
            secret_access_key: "very-secret".into(),
            session_token: None,
        };
        let printed = format!("{:?}", credentials);
        assert!(printed.contains("AKIA123"));
        assert!(!printed.contains("very-secret"));
    }

    #[test]
    fn test_credentials_json_is_tagged() {
        let credentials = Credentials::Password {
            username: Some("ops".into()),
            password: "pw".into(),
        };
        let json = serde_json::to_string(&credentials).unwrap();
        assert!(json.contains(r#""kind":"password""#));
        let back: Credentials = serde_json::from_str(&json).unwrap();
        assert_eq!(back, credentials);
    }
}
