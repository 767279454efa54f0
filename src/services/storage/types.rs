//! Canonical storage types.
//!
//! Value objects shared by every backend: entries, listing options and
//! results, progress events and transfer reports. They carry no behavior
//! beyond small helpers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::result::{OperationError, OperationResult};

/// Supported storage backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Amazon S3 and S3-compatible services (MinIO, R2, DigitalOcean Spaces)
    S3,
    /// Google Cloud Storage
    Gcs,
    /// SSH File Transfer Protocol
    Sftp,
    Ftp,
    /// SMB/CIFS share
    Smb,
    /// Local filesystem
    Local,
}

impl ProviderKind {
    /// Get the display name for this provider kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::S3 => "Amazon S3",
            ProviderKind::Gcs => "Google Cloud Storage",
            ProviderKind::Sftp => "SFTP",
            ProviderKind::Ftp => "FTP",
            ProviderKind::Smb => "SMB Share",
            ProviderKind::Local => "Local Filesystem",
        }
    }

    /// Stable lowercase tag, as used in profiles.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::S3 => "s3",
            ProviderKind::Gcs => "gcs",
            ProviderKind::Sftp => "sftp",
            ProviderKind::Ftp => "ftp",
            ProviderKind::Smb => "smb",
            ProviderKind::Local => "local",
        }
    }

    /// URI scheme used by `object_uri`.
    pub fn scheme(&self) -> &'static str {
        match self {
            ProviderKind::S3 => "s3",
            ProviderKind::Gcs => "gs",
            ProviderKind::Sftp => "sftp",
            ProviderKind::Ftp => "ftp",
            ProviderKind::Smb => "smb",
            ProviderKind::Local => "file",
        }
    }

    /// Get all available provider kinds.
    pub fn all() -> Vec<ProviderKind> {
        vec![
            ProviderKind::S3,
            ProviderKind::Gcs,
            ProviderKind::Sftp,
            ProviderKind::Ftp,
            ProviderKind::Smb,
            ProviderKind::Local,
        ]
    }

    /// Check if this provider kind requires credentials.
    pub fn requires_credentials(&self) -> bool {
        !matches!(self, ProviderKind::Local)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::all()
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown provider type: {}", s))
    }
}

/// Kind of an [`Entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
    Bucket,
    Symlink,
}

impl EntryType {
    /// Entries that act as containers of other entries.
    pub fn is_container(&self) -> bool {
        matches!(self, EntryType::Directory | EntryType::Bucket)
    }
}

/// Backend-specific entry metadata. An absent field means the backend does
/// not track it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// POSIX mode bits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    /// Container region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_count: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

impl EntryMetadata {
    pub fn is_empty(&self) -> bool {
        *self == EntryMetadata::default()
    }
}

/// A file, directory, bucket or symlink as seen through any backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Session-local identifier. Providers fill it with the normalized path;
    /// callers that need rename-stable ids use `EntryIdTracker`.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Provider-relative path, normalized for the backend's path style.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
}

impl Entry {
    fn new(path: String, entry_type: EntryType) -> Self {
        let name = entry_name(&path);
        Self {
            id: path.clone(),
            name,
            entry_type,
            path,
            size: None,
            modified: None,
            metadata: None,
        }
    }

    /// Create a file entry.
    pub fn file(path: impl Into<String>, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        let mut entry = Self::new(path.into(), EntryType::File);
        entry.size = Some(size);
        entry.modified = modified;
        entry
    }

    /// Create a directory entry.
    pub fn directory(path: impl Into<String>) -> Self {
        Self::new(path.into(), EntryType::Directory)
    }

    /// Create a bucket entry.
    pub fn bucket(name: impl Into<String>) -> Self {
        Self::new(name.into(), EntryType::Bucket)
    }

    /// Create a symlink entry pointing at `target`.
    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        let mut entry = Self::new(path.into(), EntryType::Symlink);
        entry.metadata = Some(EntryMetadata {
            symlink_target: Some(target.into()),
            ..Default::default()
        });
        entry
    }

    pub fn with_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self
    }

    /// Attach metadata, dropping it when every field is empty.
    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        };
        self
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type.is_container()
    }

    pub fn is_file(&self) -> bool {
        self.entry_type == EntryType::File
    }

    /// Get a human-readable size string.
    pub fn size_display(&self) -> String {
        match self.size {
            Some(bytes) if bytes >= 1_073_741_824 => {
                format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
            }
            Some(bytes) if bytes >= 1_048_576 => {
                format!("{:.1} MB", bytes as f64 / 1_048_576.0)
            }
            Some(bytes) if bytes >= 1024 => {
                format!("{:.1} KB", bytes as f64 / 1024.0)
            }
            Some(bytes) => format!("{} B", bytes),
            None => "-".to_string(),
        }
    }

    /// Get the file extension if any.
    pub fn extension(&self) -> Option<&str> {
        if self.is_dir() {
            return None;
        }
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            None
        } else {
            Some(ext)
        }
    }

    /// Dot-files are hidden.
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }
}

/// Last path segment, ignoring a trailing slash.
pub fn entry_name(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

/// Sort key for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    Name,
    Modified,
    Size,
    Type,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Options for a single `list` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListOptions {
    /// Maximum entries per page. `None` returns everything.
    pub limit: Option<usize>,
    /// Token returned by the previous page, passed back verbatim.
    pub continuation_token: Option<String>,
    pub recursive: bool,
    /// Only entries whose name starts with this prefix.
    pub prefix: Option<String>,
    /// Only files with this extension (case-insensitive, no dot).
    pub extension: Option<String>,
    /// `None` includes hidden entries.
    pub include_hidden: Option<bool>,
    pub sort_by: Option<SortBy>,
    pub sort_order: SortOrder,
}

impl ListOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.continuation_token = token;
        self
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    pub fn includes_hidden(&self) -> bool {
        self.include_hidden.unwrap_or(true)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    pub entries: Vec<Entry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Canonical progress report handed to the caller's callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub operation: String,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// Always within `0..=100`.
    pub percentage: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u64>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_second: Option<f64>,
}

impl ProgressEvent {
    /// `round(transferred / total * 100)` clamped to `0..=100`, or 0 when the
    /// total is unknown or zero.
    pub fn percentage_of(transferred: u64, total: Option<u64>) -> u8 {
        match total {
            Some(total) if total > 0 => {
                let pct = (transferred as f64 / total as f64 * 100.0).round();
                pct.clamp(0.0, 100.0) as u8
            }
            _ => 0,
        }
    }
}

/// State of a multi-item transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Listing,
    Transferring,
    Completed,
    PartiallyFailed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::PartiallyFailed | TransferState::Cancelled
        )
    }
}

/// A single item that failed inside a batch or directory operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFailure {
    pub path: String,
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ItemFailure {
    pub fn new(path: impl Into<String>, error: &OperationError) -> Self {
        Self {
            path: path.into(),
            code: error.code().to_string(),
            message: error.message().to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// Aggregated outcome of a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub operation: String,
    pub state: TransferState,
    pub files_processed: u64,
    pub total_files: u64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub failures: Vec<ItemFailure>,
}

impl TransferReport {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            state: TransferState::Listing,
            files_processed: 0,
            total_files: 0,
            bytes_transferred: 0,
            total_bytes: 0,
            failures: Vec::new(),
        }
    }
}

/// Outcome for one key of a batch delete.
#[derive(Debug, Clone)]
pub struct KeyOutcome {
    pub key: String,
    pub result: OperationResult<()>,
}

impl KeyOutcome {
    pub fn ok(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            result: Ok(()),
        }
    }

    pub fn failed(key: impl Into<String>, error: OperationError) -> Self {
        Self {
            key: key.into(),
            result: Err(error),
        }
    }
}

/// Connection status of a connection-oriented backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Currently connecting.
    Connecting,
    /// Connected.
    Connected,
    /// Connection failed with error.
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Stream of content chunks returned by `read`.
pub type ByteStream = BoxStream<'static, OperationResult<Bytes>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_display() {
        assert_eq!(ProviderKind::S3.display_name(), "Amazon S3");
        assert_eq!(ProviderKind::Local.display_name(), "Local Filesystem");
        assert_eq!("sftp".parse::<ProviderKind>(), Ok(ProviderKind::Sftp));
        assert!(!ProviderKind::Local.requires_credentials());
    }

    #[test]
    fn test_entry_size_display() {
        let small = Entry::file("test.txt", 500, None);
        assert_eq!(small.size_display(), "500 B");

        let medium = Entry::file("test.txt", 1_500_000, None);
        assert_eq!(medium.size_display(), "1.4 MB");

        let large = Entry::file("test.txt", 2_500_000_000, None);
        assert_eq!(large.size_display(), "2.3 GB");

        assert_eq!(Entry::directory("data/").size_display(), "-");
    }

    #[test]
    fn test_entry_extension_and_hidden() {
        let file = Entry::file("data/test.parquet", 1000, None);
        assert_eq!(file.name, "test.parquet");
        assert_eq!(file.extension(), Some("parquet"));

        let dir = Entry::directory("data/");
        assert_eq!(dir.name, "data");
        assert_eq!(dir.extension(), None);

        let dotfile = Entry::file("/home/u/.bashrc", 10, None);
        assert!(dotfile.is_hidden());
        assert_eq!(dotfile.extension(), None);
    }

    #[test]
    fn test_percentage_is_clamped() {
        assert_eq!(ProgressEvent::percentage_of(0, Some(0)), 0);
        assert_eq!(ProgressEvent::percentage_of(5, None), 0);
        assert_eq!(ProgressEvent::percentage_of(1, Some(3)), 33);
        assert_eq!(ProgressEvent::percentage_of(2, Some(3)), 67);
        assert_eq!(ProgressEvent::percentage_of(10, Some(5)), 100);
    }

    #[test]
    fn test_entry_serializes_contract_field_names() {
        let entry = Entry::symlink("/tmp/link", "/etc/hosts");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "symlink");
        assert_eq!(value["metadata"]["symlinkTarget"], "/etc/hosts");
        assert!(value.get("size").is_none());
    }
}
