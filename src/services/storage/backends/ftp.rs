//! FTP and FTPS using OpenDAL.
//!
//! Sessions are pooled by OpenDAL's FTP connection pool, so concurrent calls
//! on one provider run on separate control connections. A dropped
//! connection marks the provider `Failed` and the next call reconnects.

use opendal::layers::LoggingLayer;
use opendal::services::Ftp;
use opendal::Operator;
use serde::{Deserialize, Serialize};

use super::operator::{OperatorBackend, OperatorDescriptor};
use crate::services::profiles::Credentials;
use crate::services::storage::{
    Capability, CapabilitySet, OperationError, OperationResult, PathStyle, ProviderKind,
    TransferLimits,
};

pub const CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
    Capability::List,
    Capability::Read,
    Capability::Write,
    Capability::Delete,
    Capability::Mkdir,
    Capability::Rmdir,
    Capability::Copy,
    Capability::Move,
    Capability::Download,
    Capability::Upload,
    Capability::Resume,
    Capability::Metadata,
    Capability::Connection,
]);

fn default_port() -> u16 {
    21
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit TLS (`ftps://`).
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl FtpConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            secure: false,
            root: None,
        }
    }

    fn endpoint(&self) -> String {
        let scheme = if self.secure { "ftps" } else { "ftp" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

fn build_operator(config: &FtpConfig, credentials: Option<&Credentials>) -> OperationResult<Operator> {
    let mut builder = Ftp::default().endpoint(&config.endpoint());
    if let Some(root) = config.root.as_deref() {
        builder = builder.root(root);
    }

    match credentials {
        Some(Credentials::Password { username, password }) => {
            builder = builder
                .user(username.as_deref().unwrap_or("anonymous"))
                .password(password);
        }
        Some(Credentials::Anonymous) | None => {}
        Some(other) => {
            return Err(OperationError::invalid_input(format!(
                "FTP does not accept {} credentials",
                other.kind_name()
            )));
        }
    }

    Ok(Operator::new(builder)?.layer(LoggingLayer::default()).finish())
}

pub fn backend(config: &FtpConfig, credentials: Option<Credentials>) -> OperationResult<OperatorBackend> {
    build_operator(config, credentials.as_ref())?;

    let descriptor = OperatorDescriptor {
        kind: ProviderKind::Ftp,
        style: PathStyle::Posix,
        capabilities: CAPABILITIES,
        limits: TransferLimits::default(),
        uri_base: config.endpoint(),
        container: None,
    };
    let config = config.clone();
    Ok(OperatorBackend::new(descriptor, move || {
        build_operator(&config, credentials.as_ref())
    }))
}
