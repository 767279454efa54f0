//! S3 and S3-compatible storage (AWS, MinIO, R2, Spaces) using OpenDAL.
//!
//! Directories are key prefixes: `mkdir` writes a zero-byte `prefix/`
//! marker and `rmdir` is not offered. Moves are server-side copy plus
//! delete.

use opendal::layers::LoggingLayer;
use opendal::services::S3;
use opendal::Operator;
use serde::{Deserialize, Serialize};

use super::operator::{OperatorBackend, OperatorDescriptor};
use crate::services::profiles::Credentials;
use crate::services::storage::{
    Capability, CapabilitySet, Entry, EntryMetadata, OperationError, OperationResult, PathStyle,
    ProviderKind, TransferLimits,
};

pub const CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
    Capability::List,
    Capability::Read,
    Capability::Write,
    Capability::Delete,
    Capability::Mkdir,
    Capability::Copy,
    Capability::Move,
    Capability::ServerSideCopy,
    Capability::Download,
    Capability::Upload,
    Capability::Resume,
    Capability::Versioning,
    Capability::Metadata,
    Capability::PresignedUrls,
    Capability::BatchDelete,
    Capability::Containers,
]);

/// Documented S3 API limits.
pub const LIMITS: TransferLimits = TransferLimits {
    min_part_size: 5 * 1024 * 1024,
    max_part_size: 5 * 1024 * 1024 * 1024,
    max_parts: 10_000,
    max_batch_delete: 1000,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services. Empty for AWS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub virtual_host_style: bool,
    /// Unsigned requests for public buckets.
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
            virtual_host_style: false,
            allow_anonymous: false,
            root: None,
        }
    }
}

fn build_operator(config: &S3Config, credentials: Option<&Credentials>) -> OperationResult<Operator> {
    let mut builder = S3::default().bucket(&config.bucket).region(&config.region);

    if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
        builder = builder.endpoint(endpoint);
    }
    if let Some(root) = config.root.as_deref() {
        builder = builder.root(root);
    }
    if config.virtual_host_style {
        builder = builder.enable_virtual_host_style();
    }

    match credentials {
        _ if config.allow_anonymous => builder = builder.allow_anonymous(),
        Some(Credentials::AccessKey {
            access_key_id,
            secret_access_key,
            session_token,
        }) => {
            builder = builder
                .access_key_id(access_key_id)
                .secret_access_key(secret_access_key);
            if let Some(token) = session_token {
                builder = builder.session_token(token);
            }
        }
        Some(Credentials::Anonymous) => builder = builder.allow_anonymous(),
        // Fall back to the environment and instance profile.
        None => {}
        Some(other) => {
            return Err(OperationError::invalid_input(format!(
                "S3 does not accept {} credentials",
                other.kind_name()
            )));
        }
    }

    Ok(Operator::new(builder)?.layer(LoggingLayer::default()).finish())
}

pub fn backend(config: &S3Config, credentials: Option<Credentials>) -> OperationResult<OperatorBackend> {
    // Surface configuration errors at construction, not on first call.
    build_operator(config, credentials.as_ref())?;

    let container = Entry::bucket(config.bucket.clone()).with_metadata(EntryMetadata {
        region: Some(config.region.clone()),
        ..Default::default()
    });
    let descriptor = OperatorDescriptor {
        kind: ProviderKind::S3,
        style: PathStyle::ObjectKey,
        capabilities: CAPABILITIES,
        limits: LIMITS,
        uri_base: format!("s3://{}", config.bucket),
        container: Some(container),
    };
    let config = config.clone();
    Ok(OperatorBackend::new(descriptor, move || {
        build_operator(&config, credentials.as_ref())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::StorageBackend;

    #[test]
    fn test_object_uri() {
        let backend = backend(&S3Config::new("my-bucket", "us-east-1"), None).unwrap();
        assert_eq!(backend.object_uri("data/file.txt"), "s3://my-bucket/data/file.txt");
        assert_eq!(backend.path_style(), PathStyle::ObjectKey);
    }

    #[test]
    fn test_rejects_password_credentials() {
        let credentials = Credentials::Password {
            username: None,
            password: "secret".into(),
        };
        let err = backend(&S3Config::new("b", "us-east-1"), Some(credentials)).err().unwrap();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn test_declares_object_store_capabilities() {
        assert!(CAPABILITIES.contains(Capability::ServerSideCopy));
        assert!(CAPABILITIES.contains(Capability::BatchDelete));
        assert!(!CAPABILITIES.contains(Capability::Rmdir));
        assert!(!CAPABILITIES.contains(Capability::Connection));
    }

    #[test]
    fn test_bucket_is_the_container() {
        smol::block_on(async {
            let backend = backend(&S3Config::new("logs", "eu-west-1"), None).unwrap();
            let containers = backend.list_containers().await.unwrap();
            assert_eq!(containers.len(), 1);
            assert_eq!(containers[0].name, "logs");
            assert_eq!(
                containers[0].metadata.as_ref().and_then(|m| m.region.as_deref()),
                Some("eu-west-1")
            );
        });
    }
}
