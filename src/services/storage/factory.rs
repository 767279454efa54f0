//! Provider factory.
//!
//! Builds the backend matching a profile's [`ProviderConfig`] and wraps it
//! in a [`StorageProvider`].

use tracing::info;

use super::backends::{self, LocalBackend, SftpBackend, SmbBackend};
use super::capability::CapabilitySet;
use super::provider::StorageProvider;
use super::result::{OperationError, OperationResult};
use super::traits::BoxedStorageBackend;
use super::types::ProviderKind;
use crate::services::profiles::{Credentials, ProviderConfig};
use crate::settings::EngineSettings;

/// Factory for creating providers from configuration.
///
/// # Example
///
/// ```ignore
/// use stowage::services::profiles::ProviderConfig;
/// use stowage::services::storage::backends::S3Config;
/// use stowage::services::storage::ProviderFactory;
///
/// let config = ProviderConfig::S3(S3Config::new("my-bucket", "us-east-1"));
/// let provider = ProviderFactory::create("archive", &config, None, &settings)?;
/// ```
pub struct ProviderFactory;

impl ProviderFactory {
    /// Create a provider for `config`.
    ///
    /// # Errors
    ///
    /// Returns `invalid_input` when the configuration does not validate or
    /// the credentials are of a kind the backend cannot use. No connection
    /// is opened; connection-oriented backends connect on first use.
    pub fn create(
        name: &str,
        config: &ProviderConfig,
        credentials: Option<Credentials>,
        settings: &EngineSettings,
    ) -> OperationResult<StorageProvider> {
        config.validate().map_err(OperationError::from)?;

        let backend: BoxedStorageBackend = match config {
            ProviderConfig::S3(c) => Box::new(backends::s3::backend(c, credentials)?),
            ProviderConfig::Gcs(c) => Box::new(backends::gcs::backend(c, credentials)?),
            ProviderConfig::Ftp(c) => Box::new(backends::ftp::backend(c, credentials)?),
            ProviderConfig::Sftp(c) => Box::new(SftpBackend::new(c, credentials)),
            ProviderConfig::Smb(c) => Box::new(SmbBackend::new(c)),
            ProviderConfig::Local(c) => Box::new(LocalBackend::new(c)),
        };

        info!("Created {} provider '{}'", config.kind().display_name(), name);
        Ok(StorageProvider::new(name, backend, settings))
    }

    /// Check if a provider kind has a backend implementation.
    pub fn is_supported(kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::S3
            | ProviderKind::Gcs
            | ProviderKind::Sftp
            | ProviderKind::Ftp
            | ProviderKind::Smb
            | ProviderKind::Local => true,
        }
    }

    pub fn supported_kinds() -> Vec<ProviderKind> {
        ProviderKind::all()
            .into_iter()
            .filter(|k| Self::is_supported(*k))
            .collect()
    }

    /// The capabilities a provider of `kind` will declare, without building one.
    pub fn capabilities_for(kind: ProviderKind) -> CapabilitySet {
        match kind {
            ProviderKind::S3 => backends::s3::CAPABILITIES,
            ProviderKind::Gcs => backends::gcs::CAPABILITIES,
            ProviderKind::Sftp => backends::sftp::CAPABILITIES,
            ProviderKind::Ftp => backends::ftp::CAPABILITIES,
            ProviderKind::Smb => backends::smb::CAPABILITIES,
            ProviderKind::Local => backends::local_fs::CAPABILITIES,
        }
    }
}
