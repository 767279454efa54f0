//! Base provider skeleton.
//!
//! [`StorageProvider`] wraps one backend and is what callers hold. Every
//! operation runs through the same steps: capability guard, path
//! normalization, then either a native backend call (with retry) or a
//! transfer-engine helper for multi-step work.

use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::capability::{Capability, CapabilitySet};
use super::pagination::{collect_pages, paginate};
use super::path::PathStyle;
use super::result::{OperationError, OperationResult};
use super::traits::BoxedStorageBackend;
use super::types::{
    ByteStream, ConnectionState, Entry, ListOptions, ListResult, ProviderKind, TransferReport,
    TransferState,
};
use crate::services::transfer::{
    read_all, with_retry, BatchDeleteReport, CancellationToken, ProgressTracker, TransferContext,
    TransferOptions, TransferUnit,
};
use crate::settings::{EngineSettings, RetrySettings, TransferSettings};

/// A named backend behind the uniform operation surface.
///
/// Calling an operation whose capability the backend does not declare
/// returns `Unimplemented` without touching the backend.
pub struct StorageProvider {
    name: String,
    backend: BoxedStorageBackend,
    capabilities: CapabilitySet,
    style: PathStyle,
    settings: TransferSettings,
    retry: RetrySettings,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProvider")
            .field("name", &self.name)
            .field("kind", &self.backend.kind())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl StorageProvider {
    pub fn new(name: impl Into<String>, backend: BoxedStorageBackend, settings: &EngineSettings) -> Self {
        let capabilities = backend.capabilities();
        let style = backend.path_style();
        let effective = settings.transfer.effective(&backend.limits());
        Self {
            name: name.into(),
            backend,
            capabilities,
            style,
            settings: effective,
            retry: settings.retry.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.backend.kind()
    }

    /// Fixed for the lifetime of the provider.
    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn path_style(&self) -> PathStyle {
        self.style
    }

    /// Transfer settings after clamping to the backend's limits.
    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn normalize(&self, path: &str) -> String {
        self.style.normalize(path)
    }

    fn guard(&self, capability: Capability, operation: &str) -> OperationResult<()> {
        if self.capabilities.contains(capability) {
            Ok(())
        } else {
            debug!(
                "{}: {} rejected, missing capability {}",
                self.name, operation, capability
            );
            Err(OperationError::unimplemented(operation))
        }
    }

    fn guard_any(&self, capabilities: &[Capability], operation: &str) -> OperationResult<()> {
        if capabilities.iter().any(|c| self.capabilities.contains(*c)) {
            Ok(())
        } else {
            Err(OperationError::unimplemented(operation))
        }
    }

    fn context<'a>(&'a self, cancel: &'a CancellationToken, progress: &'a ProgressTracker) -> TransferContext<'a> {
        TransferContext {
            backend: self.backend.as_ref(),
            capabilities: self.capabilities,
            settings: &self.settings,
            retry: &self.retry,
            cancel,
            progress,
        }
    }

    async fn retried<T, F, Fut>(&self, operation: &str, cancel: &CancellationToken, attempt: F) -> OperationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = OperationResult<T>>,
    {
        with_retry(operation, &self.retry, cancel, attempt).await
    }

    // Connection lifecycle

    /// Open the backend session. Stateless backends have nothing to open.
    pub async fn connect(&self) -> OperationResult<()> {
        if !self.has(Capability::Connection) {
            return Ok(());
        }
        info!("Connecting provider {}", self.name);
        self.backend.connect().await
    }

    pub async fn disconnect(&self) -> OperationResult<()> {
        if !self.has(Capability::Connection) {
            return Ok(());
        }
        info!("Disconnecting provider {}", self.name);
        self.backend.disconnect().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.backend.connection_state().await
    }

    pub fn object_uri(&self, path: &str) -> String {
        self.backend.object_uri(&self.normalize(path))
    }

    // Listing and metadata

    /// List one page below `path`.
    ///
    /// A recursive listing on a backend without native recursion walks the
    /// subtree and paginates the result locally.
    pub async fn list(&self, path: &str, options: &ListOptions) -> OperationResult<ListResult> {
        self.guard(Capability::List, "list")?;
        let path = self.normalize(path);
        let cancel = CancellationToken::new();

        if options.recursive && !self.backend.native_recursive_list() {
            let progress = ProgressTracker::disabled("list");
            let walk = self.context(&cancel, &progress).walk(&path).await?;
            let mut entries = walk.directories;
            entries.extend(walk.files);
            return paginate(entries, options, &path);
        }

        self.retried("list", &cancel, || self.backend.list_page(&path, options))
            .await
    }

    /// Follow continuation tokens until the listing is exhausted.
    pub async fn list_all(&self, path: &str, options: &ListOptions) -> OperationResult<Vec<Entry>> {
        collect_pages(options.clone(), |page| async move { self.list(path, &page).await }).await
    }

    pub async fn stat(&self, path: &str) -> OperationResult<Entry> {
        self.guard_any(&[Capability::List, Capability::Metadata], "stat")?;
        let path = self.normalize(path);
        let cancel = CancellationToken::new();
        self.retried("stat", &cancel, || self.backend.stat(&path)).await
    }

    pub async fn exists(&self, path: &str) -> OperationResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn list_containers(&self) -> OperationResult<Vec<Entry>> {
        self.guard(Capability::Containers, "list_containers")?;
        self.backend.list_containers().await
    }

    pub async fn presign_read(&self, path: &str, expires: Duration) -> OperationResult<String> {
        self.guard(Capability::PresignedUrls, "presign_read")?;
        self.backend.presign_read(&self.normalize(path), expires).await
    }

    // Content

    pub async fn read(&self, path: &str) -> OperationResult<ByteStream> {
        self.guard(Capability::Read, "read")?;
        let path = self.normalize(path);
        let cancel = CancellationToken::new();
        self.retried("read", &cancel, || self.backend.read(&path)).await
    }

    pub async fn read_to_bytes(&self, path: &str) -> OperationResult<Bytes> {
        read_all(self.read(path).await?).await
    }

    pub async fn read_range(&self, path: &str, offset: u64, length: u64) -> OperationResult<Bytes> {
        self.guard(Capability::Read, "read_range")?;
        let path = self.normalize(path);
        let cancel = CancellationToken::new();
        self.retried("read_range", &cancel, || {
            self.backend.read_range(&path, offset, length)
        })
        .await
    }

    pub async fn write(&self, path: &str, data: Bytes) -> OperationResult<()> {
        self.write_with(path, data, &TransferOptions::default())
            .await
            .map(|_| ())
    }

    /// Write content, switching to multipart above the configured threshold.
    pub async fn write_with(&self, path: &str, data: Bytes, options: &TransferOptions) -> OperationResult<u64> {
        self.guard(Capability::Write, "write")?;
        let path = self.normalize(path);
        let progress = ProgressTracker::new("write", options.progress.clone());
        progress.set_totals(Some(data.len() as u64), None);
        self.context(&options.cancel, &progress)
            .write_bytes(&path, data)
            .await
    }

    // Deletion

    pub async fn delete(&self, path: &str) -> OperationResult<()> {
        self.guard(Capability::Delete, "delete")?;
        let path = self.normalize(path);
        let cancel = CancellationToken::new();
        self.retried("delete", &cancel, || self.backend.delete(&path)).await
    }

    /// Delete many keys, batched when the backend supports it.
    ///
    /// Per-key outcomes are in the report; a failing key never rolls back
    /// the others.
    pub async fn delete_many(&self, paths: &[String], options: &TransferOptions) -> OperationResult<BatchDeleteReport> {
        self.guard(Capability::Delete, "delete_many")?;
        let keys: Vec<String> = paths.iter().map(|p| self.normalize(p)).collect();
        let progress = ProgressTracker::new("delete", options.progress.clone());
        progress.set_totals(None, Some(keys.len() as u64));

        let ctx = self.context(&options.cancel, &progress);
        let deleter = ctx.deleter();
        let report = if self.has(Capability::BatchDelete) {
            deleter
                .delete_batched(&keys, self.settings.batch_delete_cap)
                .await
        } else {
            deleter.delete_each(&keys).await
        };
        info!(
            "{}: deleted {} of {} keys ({} failed)",
            self.name,
            report.deleted.len(),
            keys.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Delete a directory and everything below it.
    pub async fn delete_recursive(&self, path: &str, options: &TransferOptions) -> OperationResult<TransferReport> {
        self.guard(Capability::Delete, "delete_recursive")?;
        self.guard(Capability::List, "delete_recursive")?;
        let path = self.normalize(path);
        let progress = ProgressTracker::new("delete", options.progress.clone());
        self.context(&options.cancel, &progress)
            .delete_tree(&path)
            .await
    }

    // Directories

    pub async fn mkdir(&self, path: &str) -> OperationResult<()> {
        self.guard(Capability::Mkdir, "mkdir")?;
        self.backend.mkdir(&self.normalize(path)).await
    }

    pub async fn rmdir(&self, path: &str) -> OperationResult<()> {
        self.guard(Capability::Rmdir, "rmdir")?;
        self.backend.rmdir(&self.normalize(path)).await
    }

    // Transfers

    fn check_distinct(&self, src: &str, dst: &str) -> OperationResult<()> {
        if self.style.relative(src, dst).is_some() {
            return Err(OperationError::invalid_input(format!(
                "Destination {} is the source or inside it",
                dst
            )));
        }
        Ok(())
    }

    fn single(source: String, destination: String, size: Option<u64>) -> Vec<TransferUnit<String>> {
        vec![TransferUnit {
            source,
            destination,
            size,
        }]
    }

    /// Copy a file or directory within this provider.
    pub async fn copy(&self, src: &str, dst: &str, options: &TransferOptions) -> OperationResult<TransferReport> {
        self.guard(Capability::Copy, "copy")?;
        let (src, dst) = (self.normalize(src), self.normalize(dst));
        self.check_distinct(&src, &dst)?;

        let progress = ProgressTracker::new("copy", options.progress.clone());
        let ctx = self.context(&options.cancel, &progress);
        let entry = self.backend.stat(&src).await?;

        if entry.is_dir() {
            return ctx.copy_tree(&src, &dst).await;
        }
        ctx.run_units("copy", Self::single(src, dst, entry.size), |unit| {
            let ctx = &ctx;
            async move { ctx.copy_file(&unit.source, &unit.destination, unit.size).await }
        })
        .await
    }

    /// Move a file or directory within this provider.
    ///
    /// A directory is renamed natively when the backend can, otherwise moved
    /// entry by entry (copy then delete).
    pub async fn move_entry(&self, src: &str, dst: &str, options: &TransferOptions) -> OperationResult<TransferReport> {
        self.guard(Capability::Move, "move")?;
        let (src, dst) = (self.normalize(src), self.normalize(dst));
        self.check_distinct(&src, &dst)?;

        let progress = ProgressTracker::new("move", options.progress.clone());
        let ctx = self.context(&options.cancel, &progress);
        let entry = self.backend.stat(&src).await?;

        if entry.is_dir() {
            options.cancel.check("move")?;
            match self.backend.rename(&src, &dst).await {
                Ok(()) => {
                    debug!("{}: renamed {} to {}", self.name, src, dst);
                    let mut report = TransferReport::new("move");
                    report.state = TransferState::Completed;
                    report.total_files = 1;
                    report.files_processed = 1;
                    return Ok(report);
                }
                Err(e) if e.is_unimplemented() => return ctx.move_tree(&src, &dst).await,
                Err(e) => return Err(e),
            }
        }

        ctx.run_units("move", Self::single(src, dst, entry.size), |unit| {
            let ctx = &ctx;
            async move { ctx.move_file(&unit.source, &unit.destination, unit.size).await }
        })
        .await
    }

    /// Download a remote file or directory to `local`.
    pub async fn download(&self, remote: &str, local: &Path, options: &TransferOptions) -> OperationResult<TransferReport> {
        self.guard(Capability::Download, "download")?;
        let remote = self.normalize(remote);
        let progress = ProgressTracker::new("download", options.progress.clone());
        let ctx = self.context(&options.cancel, &progress);
        let entry = self.backend.stat(&remote).await?;

        if entry.is_dir() {
            return ctx.download_tree(&remote, local).await;
        }
        let units = vec![TransferUnit {
            source: remote,
            destination: local.to_path_buf(),
            size: entry.size,
        }];
        ctx.run_units("download", units, |unit| {
            let ctx = &ctx;
            async move { ctx.download_file(&unit.source, &unit.destination, unit.size).await }
        })
        .await
    }

    /// Upload a local file or directory to `remote`.
    pub async fn upload(&self, local: &Path, remote: &str, options: &TransferOptions) -> OperationResult<TransferReport> {
        self.guard(Capability::Upload, "upload")?;
        let remote = self.normalize(remote);
        let progress = ProgressTracker::new("upload", options.progress.clone());
        let ctx = self.context(&options.cancel, &progress);
        let metadata = async_fs::metadata(local).await?;

        if metadata.is_dir() {
            return ctx.upload_tree(local, &remote).await;
        }
        let units = Self::single(local.display().to_string(), remote, Some(metadata.len()));
        ctx.run_units("upload", units, |unit| {
            let ctx = &ctx;
            async move { ctx.upload_file(Path::new(&unit.source), &unit.destination).await }
        })
        .await
    }
}
