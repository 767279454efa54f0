//! Profile persistence.
//!
//! The manager validates; a [`ProfileStore`] only loads and saves the full
//! profile set.

use anyhow::{Context, Result};
use async_lock::Mutex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::types::Profile;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Load every saved profile. An empty store yields an empty list.
    async fn load(&self) -> Result<Vec<Profile>>;

    /// Replace the saved set with `profiles`.
    async fn save(&self, profiles: &[Profile]) -> Result<()>;
}

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ProfileFile {
    version: u32,
    profiles: Vec<Profile>,
}

/// Profiles as one JSON document, `~/.stowage/profiles.json` by default.
#[derive(Debug, Clone)]
pub struct JsonFileProfileStore {
    path: PathBuf,
}

impl JsonFileProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProfileStore for JsonFileProfileStore {
    async fn load(&self) -> Result<Vec<Profile>> {
        let raw = match async_fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No profile file at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };
        let file: ProfileFile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse profile file {}", self.path.display()))?;
        if file.version > FORMAT_VERSION {
            anyhow::bail!(
                "Profile file {} has version {}, newest supported is {}",
                self.path.display(),
                file.version,
                FORMAT_VERSION
            );
        }
        Ok(file.profiles)
    }

    /// Writes a sibling temp file and renames it over the target.
    async fn save(&self, profiles: &[Profile]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            async_fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&ProfileFile {
            version: FORMAT_VERSION,
            profiles: profiles.to_vec(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        async_fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        async_fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))
    }
}

/// In-process store for embedding and tests.
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<Vec<Profile>>,
    saves: AtomicUsize,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: Vec<Profile>) -> Self {
        Self {
            profiles: Mutex::new(profiles),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of completed saves.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn load(&self) -> Result<Vec<Profile>> {
        Ok(self.profiles.lock().await.clone())
    }

    async fn save(&self, profiles: &[Profile]) -> Result<()> {
        *self.profiles.lock().await = profiles.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::profiles::ProviderConfig;
    use crate::services::storage::backends::FtpConfig;

    #[test]
    fn test_missing_file_is_empty() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = JsonFileProfileStore::new(dir.path().join("profiles.json"));
            assert!(store.load().await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_save_then_load() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = JsonFileProfileStore::new(dir.path().join("nested/profiles.json"));
            let profiles = vec![
                Profile::default_local(dir.path().to_path_buf()),
                Profile::new("Mirror", ProviderConfig::Ftp(FtpConfig::new("ftp.example.com"))),
            ];
            store.save(&profiles).await.unwrap();

            assert_eq!(store.load().await.unwrap(), profiles);
            assert!(!dir.path().join("nested/profiles.json.tmp").exists());
        });
    }

    #[test]
    fn test_newer_version_is_refused() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("profiles.json");
            std::fs::write(&path, r#"{"version": 99, "profiles": []}"#).unwrap();
            let err = JsonFileProfileStore::new(&path).load().await.unwrap_err();
            assert!(err.to_string().contains("version 99"));
        });
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("profiles.json");
            std::fs::write(&path, "{not json").unwrap();
            assert!(JsonFileProfileStore::new(&path).load().await.is_err());
        });
    }
}
