//! Backend driven by an OpenDAL operator.
//!
//! S3, GCS and FTP differ only in how the operator is built and which
//! capabilities they declare; listing, metadata mapping, ranged reads,
//! batch delete and multipart uploads are shared here.

use async_lock::{Mutex, RwLock};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use opendal::{EntryMode, ErrorKind, Metadata, Operator, Writer};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::services::storage::pagination::{matches_filters, paginate, PageToken};
use crate::services::storage::{
    ByteStream, CapabilitySet, CompletedPart, ConnectionState, Entry, EntryMetadata, KeyOutcome,
    ListOptions, ListResult, OperationError, OperationResult, OperationStatus, PathStyle,
    ProviderKind, StorageBackend, TransferLimits,
};

impl From<opendal::Error> for OperationError {
    fn from(e: opendal::Error) -> Self {
        let message = e.to_string();
        let retryable = e.is_temporary();
        let error = match e.kind() {
            ErrorKind::NotFound => OperationError::new(OperationStatus::NotFound, "not_found", message),
            ErrorKind::PermissionDenied => {
                OperationError::new(OperationStatus::PermissionDenied, "permission_denied", message)
            }
            ErrorKind::Unsupported => {
                OperationError::new(OperationStatus::Unimplemented, "unimplemented", message)
            }
            ErrorKind::AlreadyExists => {
                OperationError::new(OperationStatus::Error, "already_exists", message)
            }
            ErrorKind::RateLimited => {
                OperationError::new(OperationStatus::Error, "rate_limited", message).with_retryable(true)
            }
            ErrorKind::ConfigInvalid => OperationError::invalid_input(message),
            _ if retryable => OperationError::connection_failed(message),
            _ => OperationError::error(message).with_code("backend_error"),
        };
        let retryable = error.is_retryable() || retryable;
        error.with_retryable(retryable).with_cause(e)
    }
}

/// Static description of one OpenDAL-backed provider.
pub struct OperatorDescriptor {
    pub kind: ProviderKind,
    pub style: PathStyle,
    pub capabilities: CapabilitySet,
    pub limits: TransferLimits,
    /// Prefix for [`StorageBackend::object_uri`], e.g. `s3://bucket`.
    pub uri_base: String,
    /// Container entry returned by `list_containers`.
    pub container: Option<Entry>,
}

type BuildFn = Box<dyn Fn() -> OperationResult<Operator> + Send + Sync>;

struct PendingUpload {
    writer: Writer,
    next_part: u32,
    /// Parts that arrived ahead of `next_part`.
    waiting: BTreeMap<u32, Bytes>,
}

pub struct OperatorBackend {
    descriptor: OperatorDescriptor,
    build: BuildFn,
    operator: RwLock<Option<Operator>>,
    state: RwLock<ConnectionState>,
    uploads: Mutex<HashMap<String, Arc<Mutex<PendingUpload>>>>,
    next_upload: AtomicU64,
}

impl OperatorBackend {
    pub fn new(descriptor: OperatorDescriptor, build: impl Fn() -> OperationResult<Operator> + Send + Sync + 'static) -> Self {
        Self {
            descriptor,
            build: Box::new(build),
            operator: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            uploads: Mutex::new(HashMap::new()),
            next_upload: AtomicU64::new(1),
        }
    }

    /// The live operator, built on first use and after a disconnect.
    async fn operator(&self) -> OperationResult<Operator> {
        if let Some(op) = self.operator.read().await.as_ref() {
            return Ok(op.clone());
        }
        let mut guard = self.operator.write().await;
        if let Some(op) = guard.as_ref() {
            return Ok(op.clone());
        }
        let op = (self.build)()?;
        *guard = Some(op.clone());
        Ok(op)
    }

    /// Track connection drops so the state reflects the last call.
    async fn observe<T>(&self, result: opendal::Result<T>) -> OperationResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = OperationError::from(e);
                if err.status() == OperationStatus::ConnectionFailed {
                    *self.state.write().await = ConnectionState::Failed(err.message().to_string());
                    self.operator.write().await.take();
                }
                Err(err)
            }
        }
    }

    fn native(&self, path: &str) -> String {
        path.trim_start_matches('/').to_string()
    }

    fn native_dir(&self, path: &str) -> String {
        let native = self.native(path);
        if native.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", native.trim_end_matches('/'))
        }
    }

    fn canonical(&self, native: &str) -> String {
        self.descriptor.style.normalize(native)
    }

    fn to_entry(&self, native: &str, metadata: &Metadata) -> Entry {
        let path = self.canonical(native);
        if metadata.mode() == EntryMode::DIR || native.ends_with('/') {
            return Entry::directory(path);
        }
        let extra = EntryMetadata {
            etag: metadata.etag().map(str::to_string),
            version_id: metadata.version().map(str::to_string),
            content_type: metadata.content_type().map(str::to_string),
            ..Default::default()
        };
        Entry::file(path, metadata.content_length(), metadata.last_modified()).with_metadata(extra)
    }

    /// Every entry of one directory level, or the whole subtree.
    async fn list_level(&self, path: &str, recursive: bool) -> OperationResult<Vec<Entry>> {
        let op = self.operator().await?;
        let dir = self.native_dir(path);
        let mut lister = self.observe(op.lister_with(&dir).recursive(recursive).await).await?;

        let mut entries = Vec::new();
        while let Some(item) = lister.next().await {
            let item = self.observe(item).await?;
            if item.path() == dir || item.path().trim_end_matches('/') == dir.trim_end_matches('/') {
                continue;
            }
            entries.push(self.to_entry(item.path(), item.metadata()));
        }
        Ok(entries)
    }

    /// Key-ordered page via the service's `start_after`, used for unsorted
    /// recursive listings so deep trees are not listed in full per page.
    async fn list_after(&self, path: &str, options: &ListOptions, limit: usize) -> OperationResult<ListResult> {
        let after = match options.continuation_token.as_deref() {
            Some(token) => match PageToken::decode(token)? {
                PageToken::After(key) => Some(key),
                PageToken::Offset(_) => {
                    return Err(OperationError::invalid_input("Token was issued by a different listing")
                        .with_code("invalid_continuation_token"));
                }
            },
            None => None,
        };

        let op = self.operator().await?;
        let dir = self.native_dir(path);
        let mut builder = op.lister_with(&dir).recursive(true);
        if let Some(after) = after.as_deref() {
            builder = builder.start_after(after);
        }
        let mut lister = self.observe(builder.await).await?;

        let mut entries = Vec::with_capacity(limit);
        let mut last_key = None;
        let mut has_more = false;
        while let Some(item) = lister.next().await {
            let item = self.observe(item).await?;
            if item.path() == dir {
                continue;
            }
            let entry = self.to_entry(item.path(), item.metadata());
            if !matches_filters(&entry, options) {
                continue;
            }
            if entries.len() == limit {
                has_more = true;
                break;
            }
            last_key = Some(item.path().to_string());
            entries.push(entry);
        }

        Ok(ListResult {
            entries,
            continuation_token: if has_more {
                last_key.map(|k| PageToken::After(k).encode())
            } else {
                None
            },
            has_more,
            total_count: None,
            path: Some(path.to_string()),
        })
    }

    async fn is_directory(&self, op: &Operator, path: &str) -> OperationResult<bool> {
        let dir = self.native_dir(path);
        if op.stat(&dir).await.is_ok() {
            return Ok(true);
        }
        let mut lister = self.observe(op.lister_with(&dir).await).await?;
        while let Some(item) = lister.next().await {
            let item = self.observe(item).await?;
            if item.path() != dir {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn pending(&self, upload_id: &str) -> OperationResult<Arc<Mutex<PendingUpload>>> {
        self.uploads
            .lock()
            .await
            .get(upload_id)
            .cloned()
            .ok_or_else(|| OperationError::not_found(format!("upload {}", upload_id)))
    }
}

#[async_trait]
impl StorageBackend for OperatorBackend {
    fn kind(&self) -> ProviderKind {
        self.descriptor.kind
    }

    fn capabilities(&self) -> CapabilitySet {
        self.descriptor.capabilities
    }

    fn path_style(&self) -> PathStyle {
        self.descriptor.style
    }

    fn limits(&self) -> TransferLimits {
        self.descriptor.limits
    }

    fn object_uri(&self, path: &str) -> String {
        format!("{}/{}", self.descriptor.uri_base, self.native(path))
    }

    fn native_recursive_list(&self) -> bool {
        true
    }

    fn supports_multipart(&self) -> bool {
        self.descriptor.style == PathStyle::ObjectKey
    }

    async fn connect(&self) -> OperationResult<()> {
        *self.state.write().await = ConnectionState::Connecting;
        let op = match (self.build)() {
            Ok(op) => op,
            Err(e) => {
                *self.state.write().await = ConnectionState::Failed(e.message().to_string());
                return Err(e);
            }
        };
        if let Err(e) = op.check().await {
            let err = OperationError::from(e);
            warn!("{} connection check failed: {}", self.descriptor.kind, err);
            *self.state.write().await = ConnectionState::Failed(err.message().to_string());
            return Err(err);
        }
        *self.operator.write().await = Some(op);
        *self.state.write().await = ConnectionState::Connected;
        debug!("Connected to {}", self.descriptor.uri_base);
        Ok(())
    }

    async fn disconnect(&self) -> OperationResult<()> {
        self.operator.write().await.take();
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    async fn list_page(&self, path: &str, options: &ListOptions) -> OperationResult<ListResult> {
        if options.recursive && options.sort_by.is_none() {
            if let Some(limit) = options.limit.filter(|l| *l > 0) {
                let op = self.operator().await?;
                if op.info().full_capability().list_with_start_after {
                    return self.list_after(path, options, limit).await;
                }
            }
        }
        let entries = self.list_level(path, options.recursive).await?;
        paginate(entries, options, path)
    }

    async fn stat(&self, path: &str) -> OperationResult<Entry> {
        if self.descriptor.style.is_root(path) {
            return Ok(Entry::directory(path));
        }
        let op = self.operator().await?;
        let native = self.native(path);
        match op.stat(&native).await {
            Ok(metadata) => Ok(self.to_entry(&native, &metadata)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.is_directory(&op, path).await? {
                    Ok(Entry::directory(path))
                } else {
                    Err(OperationError::not_found(path))
                }
            }
            Err(e) => self.observe(Err(e)).await,
        }
    }

    async fn read(&self, path: &str) -> OperationResult<ByteStream> {
        let op = self.operator().await?;
        let native = self.native(path);
        let reader = self.observe(op.reader(&native).await).await?;
        let stream = self.observe(reader.into_bytes_stream(..).await).await?;
        Ok(stream.map(|chunk| chunk.map_err(OperationError::from)).boxed())
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> OperationResult<Bytes> {
        let op = self.operator().await?;
        let native = self.native(path);
        let end = offset.saturating_add(length);
        let buffer = self
            .observe(op.read_with(&native).range(offset..end).await)
            .await?;
        Ok(buffer.to_bytes())
    }

    async fn write(&self, path: &str, data: Bytes) -> OperationResult<()> {
        let op = self.operator().await?;
        self.observe(op.write(&self.native(path), data).await).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> OperationResult<()> {
        let op = self.operator().await?;
        let native = self.native(path);
        // Deleting a missing key is not an error on object stores.
        if self.descriptor.style == PathStyle::Posix && !self.observe(op.exists(&native).await).await? {
            return Err(OperationError::not_found(path));
        }
        self.observe(op.delete(&native).await).await
    }

    async fn mkdir(&self, path: &str) -> OperationResult<()> {
        let op = self.operator().await?;
        self.observe(op.create_dir(&self.native_dir(path)).await).await
    }

    async fn rmdir(&self, path: &str) -> OperationResult<()> {
        let op = self.operator().await?;
        let dir = self.native_dir(path);
        let mut lister = self.observe(op.lister_with(&dir).await).await?;
        while let Some(item) = lister.next().await {
            if self.observe(item).await?.path() != dir {
                return Err(OperationError::error(format!("Directory not empty: {}", path))
                    .with_code("directory_not_empty"));
            }
        }
        self.observe(op.delete(&dir).await).await
    }

    async fn server_copy(&self, src: &str, dst: &str) -> OperationResult<()> {
        let op = self.operator().await?;
        self.observe(op.copy(&self.native(src), &self.native(dst)).await)
            .await
    }

    async fn rename(&self, src: &str, dst: &str) -> OperationResult<()> {
        let op = self.operator().await?;
        if !op.info().full_capability().rename {
            return Err(OperationError::unimplemented("rename"));
        }
        self.observe(op.rename(&self.native(src), &self.native(dst)).await)
            .await
    }

    /// One request for the whole batch. When the service rejects it, keys
    /// are retried one by one so each gets its own outcome.
    async fn delete_batch(&self, keys: &[String]) -> OperationResult<Vec<KeyOutcome>> {
        let op = self.operator().await?;
        let native: Vec<String> = keys.iter().map(|k| self.native(k)).collect();

        #[allow(deprecated)]
        let batch = op.remove(native.clone()).await;
        match batch {
            Ok(()) => Ok(keys.iter().map(|k| KeyOutcome::ok(k.clone())).collect()),
            Err(e) if e.kind() == ErrorKind::Unsupported || !e.is_temporary() => {
                debug!("Batch delete rejected ({}), deleting {} keys individually", e, keys.len());
                let mut outcomes = Vec::with_capacity(keys.len());
                for (key, native) in keys.iter().zip(native) {
                    match op.delete(&native).await {
                        Ok(()) => outcomes.push(KeyOutcome::ok(key.clone())),
                        Err(e) => outcomes.push(KeyOutcome::failed(key.clone(), e.into())),
                    }
                }
                Ok(outcomes)
            }
            Err(e) => self.observe(Err(e)).await,
        }
    }

    async fn multipart_begin(&self, path: &str) -> OperationResult<String> {
        let op = self.operator().await?;
        let writer = self.observe(op.writer(&self.native(path)).await).await?;
        let id = format!("{}-{}", self.descriptor.kind.as_str(), self.next_upload.fetch_add(1, Ordering::Relaxed));
        self.uploads.lock().await.insert(
            id.clone(),
            Arc::new(Mutex::new(PendingUpload {
                writer,
                next_part: 1,
                waiting: BTreeMap::new(),
            })),
        );
        Ok(id)
    }

    /// Parts reach the writer strictly in ascending number. A part that
    /// arrives early waits until its predecessors have been written.
    async fn multipart_put_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> OperationResult<CompletedPart> {
        let pending = self.pending(upload_id).await?;
        let size = data.len() as u64;
        let mut upload = pending.lock().await;
        upload.waiting.insert(part_number, data);

        loop {
            let next = upload.next_part;
            let Some(chunk) = upload.waiting.remove(&next) else {
                break;
            };
            self.observe(upload.writer.write(chunk).await).await?;
            upload.next_part += 1;
        }

        Ok(CompletedPart {
            part_number,
            etag: None,
            size,
        })
    }

    async fn multipart_complete(&self, upload_id: &str, parts: &[CompletedPart]) -> OperationResult<()> {
        let pending = self
            .uploads
            .lock()
            .await
            .remove(upload_id)
            .ok_or_else(|| OperationError::not_found(format!("upload {}", upload_id)))?;
        let mut upload = pending.lock().await;
        let written = upload.next_part.saturating_sub(1) as usize;
        if !upload.waiting.is_empty() || written != parts.len() {
            if let Err(e) = upload.writer.abort().await {
                warn!("Failed to abort incomplete upload {}: {}", upload_id, e);
            }
            return Err(OperationError::invalid_input(format!(
                "Upload {} has {} contiguous parts, completion listed {}",
                upload_id,
                written,
                parts.len()
            )));
        }
        self.observe(upload.writer.close().await).await?;
        Ok(())
    }

    async fn multipart_abort(&self, upload_id: &str) -> OperationResult<()> {
        let Some(pending) = self.uploads.lock().await.remove(upload_id) else {
            return Ok(());
        };
        let mut upload = pending.lock().await;
        self.observe(upload.writer.abort().await).await
    }

    async fn list_containers(&self) -> OperationResult<Vec<Entry>> {
        Ok(self.descriptor.container.iter().cloned().collect())
    }

    async fn presign_read(&self, path: &str, expires: Duration) -> OperationResult<String> {
        let op = self.operator().await?;
        let request = self
            .observe(op.presign_read(&self.native(path), expires).await)
            .await?;
        Ok(request.uri().to_string())
    }
}
