//! Single-file transfers.
//!
//! Each function moves exactly one file and reports its bytes to the shared
//! [`ProgressTracker`]. Directory transfers call these once per leaf.

use bytes::{Bytes, BytesMut};
use futures::io::AsyncWriteExt;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::multipart::{chunk_file, chunk_stream, should_use_multipart, MultipartJob};
use super::TransferContext;
use crate::services::storage::{ByteStream, Capability, OperationError, OperationResult};

/// Collect a byte stream into one buffer.
pub async fn read_all(mut stream: ByteStream) -> OperationResult<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// Sibling path used while a download is in progress.
pub fn partial_path(local: &Path) -> PathBuf {
    let mut name = local
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    local.with_file_name(name)
}

impl TransferContext<'_> {
    fn multipart_job<'a>(&'a self, path: &'a str) -> MultipartJob<'a> {
        MultipartJob {
            backend: self.backend,
            path,
            part_concurrency: self.settings.part_concurrency,
            retry: self.retry,
            cancel: self.cancel,
            progress: self.progress,
        }
    }

    fn wants_multipart(&self, size: u64) -> bool {
        should_use_multipart(
            self.backend.supports_multipart(),
            size,
            self.settings.multipart_threshold,
        )
    }

    async fn size_of(&self, path: &str, hint: Option<u64>) -> OperationResult<u64> {
        match hint {
            Some(size) => Ok(size),
            None => Ok(self.step("stat", || self.backend.stat(path)).await?.size.unwrap_or(0)),
        }
    }

    /// Download `remote` into `local`.
    ///
    /// Bytes land in `<local>.part` first and are renamed into place once
    /// complete. With the `Resume` capability an existing partial file is
    /// continued with ranged reads, and a stream that drops mid-way is
    /// resumed from the last written byte. Bytes counted towards progress
    /// are taken back if the download fails.
    pub async fn download_file(
        &self,
        remote: &str,
        local: &Path,
        size_hint: Option<u64>,
    ) -> OperationResult<u64> {
        self.cancel.check("download")?;
        if let Some(parent) = local.parent() {
            async_fs::create_dir_all(parent).await?;
        }
        let resumable = self.capabilities.contains(Capability::Resume);
        let total = if resumable {
            Some(self.size_of(remote, size_hint).await?)
        } else {
            size_hint
        };

        let part = partial_path(local);
        let mut resume_from = 0u64;
        if resumable {
            if let Ok(meta) = async_fs::metadata(&part).await {
                if total.is_some_and(|t| meta.len() <= t) {
                    resume_from = meta.len();
                }
            }
        }

        let mut counted = 0u64;
        let result = self
            .download_into(remote, &part, resume_from, total, resumable, &mut counted)
            .await;
        match result {
            Ok(written) => {
                async_fs::rename(&part, local).await?;
                debug!("Downloaded {} to {} ({} bytes)", remote, local.display(), written);
                Ok(written)
            }
            Err(e) => {
                self.progress.rewind_bytes(counted);
                if !resumable {
                    if let Err(cleanup) = async_fs::remove_file(&part).await {
                        debug!("Failed to remove {}: {}", part.display(), cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    async fn download_into(
        &self,
        remote: &str,
        part: &Path,
        resume_from: u64,
        total: Option<u64>,
        resumable: bool,
        counted: &mut u64,
    ) -> OperationResult<u64> {
        let mut file = if resume_from > 0 {
            debug!("Resuming download of {} at byte {}", remote, resume_from);
            async_fs::OpenOptions::new().append(true).open(part).await?
        } else {
            async_fs::File::create(part).await?
        };
        let mut written = resume_from;
        if resume_from > 0 {
            self.progress.add_bytes(resume_from, Some(remote));
            *counted += resume_from;
        }

        let mut needs_ranges = resume_from > 0;
        if !needs_ranges {
            let mut stream = self.step("read", || self.backend.read(remote)).await?;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        file.write_all(&bytes).await?;
                        written += bytes.len() as u64;
                        self.progress.add_bytes(bytes.len() as u64, Some(remote));
                        *counted += bytes.len() as u64;
                    }
                    Err(e) if resumable && e.is_retryable() => {
                        warn!("Read of {} dropped at byte {}: {}", remote, written, e);
                        needs_ranges = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if needs_ranges {
            let total = total.unwrap_or(written);
            while written < total {
                let length = self.settings.read_chunk_size.min(total - written);
                let offset = written;
                let bytes = self
                    .step("read_range", || self.backend.read_range(remote, offset, length))
                    .await?;
                if bytes.is_empty() {
                    break;
                }
                file.write_all(&bytes).await?;
                written += bytes.len() as u64;
                self.progress.add_bytes(bytes.len() as u64, Some(remote));
                *counted += bytes.len() as u64;
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Upload the local file at `local` to `remote`.
    pub async fn upload_file(&self, local: &Path, remote: &str) -> OperationResult<u64> {
        self.cancel.check("upload")?;
        let size = async_fs::metadata(local).await?.len();

        if self.wants_multipart(size) {
            let part_size = self.settings.part_size_for(size, &self.backend.limits());
            debug!(
                "Uploading {} to {} in {} byte parts",
                local.display(),
                remote,
                part_size
            );
            let parts = chunk_file(local.to_path_buf(), part_size).await?;
            return self.multipart_job(remote).run(parts).await;
        }

        let data = Bytes::from(async_fs::read(local).await?);
        self.step("write", || self.backend.write(remote, data.clone()))
            .await?;
        self.progress.add_bytes(size, Some(remote));
        Ok(size)
    }

    /// Write in-memory content, switching to multipart above the threshold.
    pub async fn write_bytes(&self, remote: &str, data: Bytes) -> OperationResult<u64> {
        self.cancel.check("write")?;
        let size = data.len() as u64;
        if self.wants_multipart(size) {
            let part_size = self.settings.part_size_for(size, &self.backend.limits());
            let parts = futures::stream::iter(
                super::multipart::chunk_bytes(data, part_size)
                    .into_iter()
                    .map(Ok),
            )
            .boxed();
            return self.multipart_job(remote).run(parts).await;
        }
        self.step("write", || self.backend.write(remote, data.clone()))
            .await?;
        self.progress.add_bytes(size, Some(remote));
        Ok(size)
    }

    /// Copy one object within the backend.
    ///
    /// Uses the backend's server-side copy when declared, otherwise reads the
    /// source through the client and writes it back.
    pub async fn copy_file(&self, src: &str, dst: &str, size_hint: Option<u64>) -> OperationResult<u64> {
        self.cancel.check("copy")?;
        self.copy_started(src, dst, size_hint).await
    }

    async fn copy_started(&self, src: &str, dst: &str, size_hint: Option<u64>) -> OperationResult<u64> {
        if src == dst {
            return Err(OperationError::invalid_input(format!(
                "Source and destination are the same: {}",
                src
            )));
        }

        if self.capabilities.contains(Capability::ServerSideCopy) {
            self.step("server_copy", || self.backend.server_copy(src, dst))
                .await?;
            let size = size_hint.unwrap_or(0);
            self.progress.add_bytes(size, Some(src));
            return Ok(size);
        }

        let size = self.size_of(src, size_hint).await?;
        if self.wants_multipart(size) {
            let part_size = self.settings.part_size_for(size, &self.backend.limits());
            let stream = self.step("read", || self.backend.read(src)).await?;
            return self
                .multipart_job(dst)
                .run(chunk_stream(stream, part_size))
                .await;
        }

        let stream = self.step("read", || self.backend.read(src)).await?;
        let data = read_all(stream).await?;
        let len = data.len() as u64;
        self.step("write", || self.backend.write(dst, data.clone()))
            .await?;
        self.progress.add_bytes(len, Some(src));
        Ok(len)
    }

    /// Copy then delete the source. Once the copy has started the delete
    /// always runs.
    pub async fn relocate_file(&self, src: &str, dst: &str, size_hint: Option<u64>) -> OperationResult<u64> {
        self.cancel.check("move")?;
        self.relocate_started(src, dst, size_hint).await
    }

    async fn relocate_started(&self, src: &str, dst: &str, size_hint: Option<u64>) -> OperationResult<u64> {
        let size = self.copy_started(src, dst, size_hint).await?;
        self.step("delete", || self.backend.delete(src)).await?;
        Ok(size)
    }

    /// Move one file: native rename when the backend has one, copy and
    /// delete otherwise.
    pub async fn move_file(&self, src: &str, dst: &str, size_hint: Option<u64>) -> OperationResult<u64> {
        self.cancel.check("move")?;
        match self.backend.rename(src, dst).await {
            Ok(()) => {
                let size = size_hint.unwrap_or(0);
                self.progress.add_bytes(size, Some(src));
                Ok(size)
            }
            Err(e) if e.is_unimplemented() => self.relocate_started(src, dst, size_hint).await,
            Err(e) => Err(e),
        }
    }
}
