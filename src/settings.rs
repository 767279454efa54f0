//! Engine settings.
//!
//! Transfer tunables are deployment settings, not constants: every value has
//! a default, can be overridden from a JSON file, and is clamped to the
//! target backend's [`TransferLimits`] before use.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::services::storage::TransferLimits;

const MIB: u64 = 1024 * 1024;

/// Multipart, batch and concurrency tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Uploads strictly larger than this use multipart.
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Parts in flight per multipart upload.
    pub part_concurrency: usize,
    /// Keys per batch-delete request.
    pub batch_delete_cap: usize,
    /// Entries in flight per directory transfer.
    pub directory_concurrency: usize,
    /// Chunk size for streamed and resumed reads.
    pub read_chunk_size: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            multipart_threshold: 64 * MIB,
            part_size: 8 * MIB,
            part_concurrency: 4,
            batch_delete_cap: 1000,
            directory_concurrency: 4,
            read_chunk_size: 256 * 1024,
        }
    }
}

impl TransferSettings {
    /// Settings clamped to a backend's limits. Concurrency is at least 1.
    pub fn effective(&self, limits: &TransferLimits) -> TransferSettings {
        let part_size = self
            .part_size
            .clamp(limits.min_part_size.max(1), limits.max_part_size.max(1));
        TransferSettings {
            multipart_threshold: self.multipart_threshold.max(part_size),
            part_size,
            part_concurrency: self.part_concurrency.max(1),
            batch_delete_cap: self.batch_delete_cap.clamp(1, limits.max_batch_delete.max(1)),
            directory_concurrency: self.directory_concurrency.max(1),
            read_chunk_size: self.read_chunk_size.max(1),
        }
    }

    /// Part size for an upload of `size` bytes: the configured size, grown
    /// until the part count fits within `limits.max_parts`.
    pub fn part_size_for(&self, size: u64, limits: &TransferLimits) -> u64 {
        let mut part_size = self.part_size.max(1);
        if limits.max_parts > 0 && size.div_ceil(part_size) > limits.max_parts {
            part_size = size.div_ceil(limits.max_parts);
        }
        part_size.clamp(limits.min_part_size.max(1), limits.max_part_size.max(1))
    }
}

/// Retry policy for retryable failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetrySettings {
    /// No retries. Useful for interactive calls and tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub transfer: TransferSettings,
    pub retry: RetrySettings,
    /// Profile store location. Defaults to `~/.stowage/profiles.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles_path: Option<PathBuf>,
}

impl EngineSettings {
    fn app_dir() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".stowage"))
    }

    /// `~/.stowage/settings.json`.
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("settings.json"))
    }

    /// Configured profile store path, or `~/.stowage/profiles.json`.
    pub fn profiles_path(&self) -> Result<PathBuf> {
        match &self.profiles_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::app_dir()?.join("profiles.json")),
        }
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = match async_fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        async_fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_limits() -> TransferLimits {
        TransferLimits {
            min_part_size: 5 * MIB,
            max_part_size: 5 * 1024 * MIB,
            max_parts: 10_000,
            max_batch_delete: 1000,
        }
    }

    #[test]
    fn test_effective_clamps_to_limits() {
        let settings = TransferSettings {
            part_size: MIB,
            batch_delete_cap: 5000,
            part_concurrency: 0,
            ..Default::default()
        };
        let effective = settings.effective(&s3_limits());
        assert_eq!(effective.part_size, 5 * MIB);
        assert_eq!(effective.batch_delete_cap, 1000);
        assert_eq!(effective.part_concurrency, 1);
    }

    #[test]
    fn test_part_size_grows_to_fit_max_parts() {
        let settings = TransferSettings::default();
        let limits = s3_limits();
        let size = 200 * 1024 * MIB;
        let part_size = settings.part_size_for(size, &limits);
        assert!(size.div_ceil(part_size) <= limits.max_parts);
        assert_eq!(settings.part_size_for(10 * MIB, &limits), 8 * MIB);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"transfer":{"part_size":1048576}}"#).unwrap();
        assert_eq!(settings.transfer.part_size, MIB);
        assert_eq!(settings.transfer.batch_delete_cap, 1000);
        assert_eq!(settings.retry.max_retries, 3);
    }

    #[test]
    fn test_load_missing_file_and_save_round_trip() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("nested").join("settings.json");
            assert_eq!(EngineSettings::load(&path).await.unwrap(), EngineSettings::default());

            let mut settings = EngineSettings::default();
            settings.transfer.directory_concurrency = 9;
            settings.save(&path).await.unwrap();
            let loaded = EngineSettings::load(&path).await.unwrap();
            assert_eq!(loaded.transfer.directory_concurrency, 9);
        });
    }
}
