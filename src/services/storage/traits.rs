//! Backend contract.
//!
//! A [`StorageBackend`] maps one native protocol or client library onto the
//! canonical [`Entry`] model. Backends only see paths that the provider
//! skeleton has already normalized for their [`PathStyle`], and are only
//! called for operations whose capability they declared. Optional
//! primitives default to `Unimplemented`.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use super::capability::CapabilitySet;
use super::path::PathStyle;
use super::result::{OperationError, OperationResult};
use super::types::{
    ByteStream, ConnectionState, Entry, KeyOutcome, ListOptions, ListResult, ProviderKind,
};

/// Per-request limits documented by a backend's API. Engine settings are
/// clamped to these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_parts: u64,
    pub max_batch_delete: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            min_part_size: 1,
            max_part_size: u64::MAX,
            max_parts: u64::MAX,
            max_batch_delete: usize::MAX,
        }
    }
}

/// A part acknowledged by the backend during a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based, ascending by offset.
    pub part_number: u32,
    pub etag: Option<String>,
    pub size: u64,
}

/// Core trait for storage backends.
///
/// Implementations must be safe to call concurrently. Connection-oriented
/// backends document whether they serialize calls behind one session or
/// pool sessions.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get the provider kind of this backend.
    fn kind(&self) -> ProviderKind;

    /// The fixed capability set of this backend.
    fn capabilities(&self) -> CapabilitySet;

    fn path_style(&self) -> PathStyle;

    fn limits(&self) -> TransferLimits {
        TransferLimits::default()
    }

    /// Get the full URI for a normalized path.
    fn object_uri(&self, path: &str) -> String;

    /// Whether `list_page` honours `ListOptions::recursive` itself. When
    /// false, the provider walks the tree one directory at a time.
    fn native_recursive_list(&self) -> bool {
        false
    }

    /// Whether the multipart primitives are implemented.
    fn supports_multipart(&self) -> bool {
        false
    }

    /// Open the session. Stateless backends succeed immediately.
    async fn connect(&self) -> OperationResult<()> {
        Ok(())
    }

    /// Close the session.
    async fn disconnect(&self) -> OperationResult<()> {
        Ok(())
    }

    async fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    /// List one page of entries below `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Normalized directory path (root is `""` or `"/"`)
    /// * `options` - Filters, sorting, limit and continuation token
    ///
    /// # Returns
    ///
    /// The page, with `has_more` and a continuation token when more entries
    /// follow.
    async fn list_page(&self, path: &str, options: &ListOptions) -> OperationResult<ListResult>;

    /// Get metadata for a single entry.
    async fn stat(&self, path: &str) -> OperationResult<Entry>;

    /// Read an object as a stream of chunks.
    async fn read(&self, path: &str) -> OperationResult<ByteStream>;

    /// Read `length` bytes starting at `offset`. Shorter at end of file.
    async fn read_range(&self, _path: &str, _offset: u64, _length: u64) -> OperationResult<Bytes> {
        Err(OperationError::unimplemented("read_range"))
    }

    /// Write (create or replace) an object in one request.
    async fn write(&self, path: &str, data: Bytes) -> OperationResult<()>;

    /// Delete a single file or object.
    async fn delete(&self, path: &str) -> OperationResult<()>;

    async fn mkdir(&self, _path: &str) -> OperationResult<()> {
        Err(OperationError::unimplemented("mkdir"))
    }

    /// Remove an empty directory.
    async fn rmdir(&self, _path: &str) -> OperationResult<()> {
        Err(OperationError::unimplemented("rmdir"))
    }

    /// Copy without routing bytes through the client.
    async fn server_copy(&self, _src: &str, _dst: &str) -> OperationResult<()> {
        Err(OperationError::unimplemented("server_copy"))
    }

    /// Native rename. `Unimplemented` makes the provider fall back to copy
    /// and delete.
    async fn rename(&self, _src: &str, _dst: &str) -> OperationResult<()> {
        Err(OperationError::unimplemented("rename"))
    }

    /// Delete one batch of keys, reporting an outcome for every key.
    ///
    /// The batch never exceeds `limits().max_batch_delete`. Keys that were
    /// deleted stay deleted when others fail.
    async fn delete_batch(&self, keys: &[String]) -> OperationResult<Vec<KeyOutcome>> {
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            outcomes.push(KeyOutcome {
                key: key.clone(),
                result: self.delete(key).await,
            });
        }
        Ok(outcomes)
    }

    /// Start a multipart upload and return its upload id.
    async fn multipart_begin(&self, _path: &str) -> OperationResult<String> {
        Err(OperationError::unimplemented("multipart_upload"))
    }

    /// Upload one part. Parts may arrive in any order.
    async fn multipart_put_part(
        &self,
        _upload_id: &str,
        _part_number: u32,
        _data: Bytes,
    ) -> OperationResult<CompletedPart> {
        Err(OperationError::unimplemented("multipart_upload"))
    }

    /// Assemble the upload. `parts` is sorted by ascending part number.
    async fn multipart_complete(
        &self,
        _upload_id: &str,
        _parts: &[CompletedPart],
    ) -> OperationResult<()> {
        Err(OperationError::unimplemented("multipart_upload"))
    }

    /// Release server-side resources held for the upload.
    async fn multipart_abort(&self, _upload_id: &str) -> OperationResult<()> {
        Err(OperationError::unimplemented("multipart_upload"))
    }

    /// List top-level containers (buckets).
    async fn list_containers(&self) -> OperationResult<Vec<Entry>> {
        Err(OperationError::unimplemented("list_containers"))
    }

    /// Get a presigned read URL valid for `expires`.
    async fn presign_read(&self, _path: &str, _expires: Duration) -> OperationResult<String> {
        Err(OperationError::unimplemented("presign_read"))
    }
}

/// Type alias for a boxed backend.
pub type BoxedStorageBackend = Box<dyn StorageBackend>;
