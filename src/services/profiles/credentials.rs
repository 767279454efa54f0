//! Credential collaborators.
//!
//! Secrets are kept out of the profile file. The system keyring stores each
//! profile's [`Credentials`] as JSON under its [`CredentialRef`].

use anyhow::Result;
use async_lock::Mutex;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::types::{CredentialRef, Credentials};

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolve the secret for `reference`, `None` when nothing is stored.
    async fn get(&self, reference: &CredentialRef) -> Result<Option<Credentials>>;

    async fn set(&self, reference: &CredentialRef, credentials: &Credentials) -> Result<()>;

    /// Remove the secret. Removing a missing secret succeeds.
    async fn delete(&self, reference: &CredentialRef) -> Result<()>;
}

#[cfg(feature = "keyring")]
pub use keyring_store::KeyringCredentialProvider;

#[cfg(feature = "keyring")]
mod keyring_store {
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use keyring::Entry;

    use super::CredentialProvider;
    use crate::services::profiles::types::{CredentialRef, Credentials};

    /// System keyring (Keychain, Credential Manager, Secret Service).
    #[derive(Debug, Default, Clone, Copy)]
    pub struct KeyringCredentialProvider;

    fn entry(reference: &CredentialRef) -> Result<Entry> {
        Entry::new(&reference.service, &reference.account).context("Failed to create keyring entry")
    }

    #[async_trait]
    impl CredentialProvider for KeyringCredentialProvider {
        async fn get(&self, reference: &CredentialRef) -> Result<Option<Credentials>> {
            let reference = reference.clone();
            smol::unblock(move || {
                let stored = match entry(&reference)?.get_password() {
                    Ok(stored) => stored,
                    Err(keyring::Error::NoEntry) => return Ok(None),
                    Err(e) => {
                        return Err(e).context("Failed to retrieve secret from keyring");
                    }
                };
                let credentials = serde_json::from_str(&stored)
                    .with_context(|| format!("Malformed secret for {}", reference.account))?;
                Ok(Some(credentials))
            })
            .await
        }

        async fn set(&self, reference: &CredentialRef, credentials: &Credentials) -> Result<()> {
            let reference = reference.clone();
            let json = serde_json::to_string(credentials)?;
            smol::unblock(move || {
                entry(&reference)?
                    .set_password(&json)
                    .context("Failed to store secret in keyring")
            })
            .await
        }

        async fn delete(&self, reference: &CredentialRef) -> Result<()> {
            let reference = reference.clone();
            smol::unblock(move || match entry(&reference)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e).context("Failed to delete secret from keyring"),
            })
            .await
        }
    }
}

/// Secrets held in memory for the life of the process.
#[derive(Default)]
pub struct MemoryCredentialProvider {
    entries: Mutex<HashMap<CredentialRef, Credentials>>,
}

impl MemoryCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialProvider for MemoryCredentialProvider {
    async fn get(&self, reference: &CredentialRef) -> Result<Option<Credentials>> {
        Ok(self.entries.lock().await.get(reference).cloned())
    }

    async fn set(&self, reference: &CredentialRef, credentials: &Credentials) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(reference.clone(), credentials.clone());
        Ok(())
    }

    async fn delete(&self, reference: &CredentialRef) -> Result<()> {
        self.entries.lock().await.remove(reference);
        Ok(())
    }
}

/// The keyring when built with it, otherwise an in-memory store.
#[cfg(feature = "keyring")]
pub fn default_credential_provider() -> Arc<dyn CredentialProvider> {
    Arc::new(KeyringCredentialProvider)
}

#[cfg(not(feature = "keyring"))]
pub fn default_credential_provider() -> Arc<dyn CredentialProvider> {
    tracing::warn!("Keyring feature disabled - secrets will not be stored securely");
    Arc::new(MemoryCredentialProvider::new())
}
