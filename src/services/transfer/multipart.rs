//! Multipart upload orchestration.
//!
//! Content larger than the configured threshold is cut into fixed-size parts
//! (the last one may be shorter), numbered from 1 by ascending offset. Parts
//! are uploaded with bounded concurrency and may finish in any order; the
//! completion request always lists them by ascending part number. Any
//! failure, including cancellation, aborts the upload id before the error
//! is returned. Cancellation stops new parts from starting; a part already
//! in flight finishes its retries.

use bytes::{Bytes, BytesMut};
use futures::io::AsyncReadExt;
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::cancel::CancellationToken;
use super::progress::ProgressTracker;
use super::retry::with_retry;
use crate::services::storage::{
    ByteStream, CompletedPart, OperationError, OperationResult, StorageBackend,
};
use crate::settings::RetrySettings;

/// One slice of the content, ready to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPart {
    pub part_number: u32,
    pub offset: u64,
    pub data: Bytes,
}

/// Number of parts for `size` bytes: `ceil(size / part_size)`.
pub fn part_count(size: u64, part_size: u64) -> u64 {
    size.div_ceil(part_size.max(1))
}

/// Multipart is used only when the backend supports it and the content is
/// strictly larger than the threshold. Empty content never qualifies.
pub fn should_use_multipart(supported: bool, size: u64, threshold: u64) -> bool {
    supported && size > 0 && size > threshold
}

/// Split in-memory content into parts without copying.
pub fn chunk_bytes(data: Bytes, part_size: u64) -> Vec<UploadPart> {
    let part_size = part_size.max(1) as usize;
    let mut parts = Vec::with_capacity(data.len().div_ceil(part_size));
    let mut offset = 0usize;
    let mut part_number = 1u32;
    while offset < data.len() {
        let end = (offset + part_size).min(data.len());
        parts.push(UploadPart {
            part_number,
            offset: offset as u64,
            data: data.slice(offset..end),
        });
        offset = end;
        part_number += 1;
    }
    parts
}

/// Read a local file part by part.
pub async fn chunk_file(
    path: PathBuf,
    part_size: u64,
) -> OperationResult<BoxStream<'static, OperationResult<UploadPart>>> {
    let file = async_fs::File::open(&path).await?;
    let part_size = part_size.max(1) as usize;

    let parts = stream::try_unfold((file, 1u32, 0u64), move |(mut file, part_number, offset)| async move {
        let mut buf = vec![0u8; part_size];
        let mut filled = 0;
        while filled < part_size {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok::<_, OperationError>(None);
        }
        buf.truncate(filled);
        let part = UploadPart {
            part_number,
            offset,
            data: Bytes::from(buf),
        };
        Ok(Some((part, (file, part_number + 1, offset + filled as u64))))
    });

    Ok(parts.boxed())
}

/// Regroup an arbitrary chunk stream into fixed-size parts.
pub fn chunk_stream(source: ByteStream, part_size: u64) -> BoxStream<'static, OperationResult<UploadPart>> {
    let part_size = part_size.max(1) as usize;
    let state = (source, BytesMut::new(), 1u32, 0u64, false);

    stream::try_unfold(
        state,
        move |(mut source, mut buffer, part_number, offset, mut exhausted)| async move {
            while !exhausted && buffer.len() < part_size {
                match source.next().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk?),
                    None => exhausted = true,
                }
            }
            if buffer.is_empty() {
                return Ok::<_, OperationError>(None);
            }
            let data = buffer.split_to(buffer.len().min(part_size)).freeze();
            let len = data.len() as u64;
            let part = UploadPart {
                part_number,
                offset,
                data,
            };
            Ok(Some((part, (source, buffer, part_number + 1, offset + len, exhausted))))
        },
    )
    .boxed()
}

/// Everything a multipart upload needs besides its content.
pub struct MultipartJob<'a> {
    pub backend: &'a dyn StorageBackend,
    /// Normalized destination path.
    pub path: &'a str,
    pub part_concurrency: usize,
    pub retry: &'a RetrySettings,
    pub cancel: &'a CancellationToken,
    pub progress: &'a ProgressTracker,
}

impl MultipartJob<'_> {
    /// Upload every part of `parts` and complete the upload.
    ///
    /// # Returns
    ///
    /// The number of bytes uploaded.
    pub async fn run(
        &self,
        parts: BoxStream<'_, OperationResult<UploadPart>>,
    ) -> OperationResult<u64> {
        let upload_id = self.backend.multipart_begin(self.path).await?;
        debug!("Started multipart upload {} for {}", upload_id, self.path);

        let counted = AtomicU64::new(0);
        let outcome = match self.upload_all(&upload_id, parts, &counted).await {
            Ok(mut completed) => {
                completed.sort_by_key(|p| p.part_number);
                let total: u64 = completed.iter().map(|p| p.size).sum();
                self.backend
                    .multipart_complete(&upload_id, &completed)
                    .await
                    .map(|()| (completed.len(), total))
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok((parts, total)) => {
                debug!(
                    "Completed multipart upload {} ({} parts, {} bytes)",
                    upload_id, parts, total
                );
                Ok(total)
            }
            Err(e) => {
                self.abort(&upload_id).await;
                self.progress.rewind_bytes(counted.load(Ordering::SeqCst));
                Err(e)
            }
        }
    }

    async fn abort(&self, upload_id: &str) {
        warn!("Aborting multipart upload {} for {}", upload_id, self.path);
        if let Err(e) = self.backend.multipart_abort(upload_id).await {
            warn!("Failed to abort multipart upload {}: {}", upload_id, e);
        }
    }

    /// Upload parts with bounded concurrency. After the first failure no new
    /// part starts; parts already in flight are drained before returning.
    async fn upload_all(
        &self,
        upload_id: &str,
        mut parts: BoxStream<'_, OperationResult<UploadPart>>,
        counted: &AtomicU64,
    ) -> OperationResult<Vec<CompletedPart>> {
        let put = move |part: UploadPart| async move {
            let size = part.data.len() as u64;
            let completed = with_retry("upload_part", self.retry, CancellationToken::uncancellable(), || {
                self.backend
                    .multipart_put_part(upload_id, part.part_number, part.data.clone())
            })
            .await?;
            self.progress.add_bytes(size, Some(self.path));
            counted.fetch_add(size, Ordering::SeqCst);
            Ok::<_, OperationError>(completed)
        };

        let concurrency = self.part_concurrency.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut completed = Vec::new();
        let mut failure: Option<OperationError> = None;
        let mut source_done = false;

        loop {
            while failure.is_none() && !source_done && in_flight.len() < concurrency {
                if self.cancel.is_cancelled() {
                    failure = Some(OperationError::cancelled("multipart_upload"));
                    break;
                }
                match parts.next().await {
                    Some(Ok(part)) => in_flight.push(put(part)),
                    Some(Err(e)) => failure = Some(e),
                    None => source_done = true,
                }
            }

            match in_flight.next().await {
                Some(Ok(part)) => completed.push(part),
                Some(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                None => break,
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::backends::memory::MemoryBackend;
    use std::time::Duration;

    fn job<'a>(
        backend: &'a MemoryBackend,
        retry: &'a RetrySettings,
        cancel: &'a CancellationToken,
        progress: &'a ProgressTracker,
    ) -> MultipartJob<'a> {
        MultipartJob {
            backend,
            path: "big.bin",
            part_concurrency: 3,
            retry,
            cancel,
            progress,
        }
    }

    fn content(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_part_count_is_ceiling() {
        assert_eq!(part_count(0, 4), 0);
        assert_eq!(part_count(1, 4), 1);
        assert_eq!(part_count(8, 4), 2);
        assert_eq!(part_count(9, 4), 3);
    }

    #[test]
    fn test_empty_content_never_uses_multipart() {
        assert!(!should_use_multipart(true, 0, 0));
        assert!(!should_use_multipart(true, 10, 10));
        assert!(should_use_multipart(true, 11, 10));
        assert!(!should_use_multipart(false, 11, 10));
    }

    #[test]
    fn test_chunk_bytes_last_part_is_shorter() {
        let parts = chunk_bytes(content(10), 4);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].offset, 8);
        assert_eq!(parts[2].data.len(), 2);
        assert_eq!(
            parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_chunk_stream_regroups() {
        let source: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defgh")),
            Ok(Bytes::from_static(b"i")),
        ])
        .boxed();
        let parts: Vec<_> = smol::block_on(chunk_stream(source, 4).collect::<Vec<_>>());
        let parts: Vec<UploadPart> = parts.into_iter().map(|p| p.unwrap()).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(&parts[0].data[..], b"abcd");
        assert_eq!(&parts[1].data[..], b"efgh");
        assert_eq!(&parts[2].data[..], b"i");
        assert_eq!(parts[2].offset, 8);
    }

    #[test]
    fn test_chunk_file_reads_all_parts() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("data.bin");
            std::fs::write(&path, content(10)).unwrap();
            let parts: Vec<_> = chunk_file(path, 3).await.unwrap().collect().await;
            assert_eq!(parts.len(), 4);
            assert_eq!(parts[3].as_ref().unwrap().data.len(), 1);
        });
    }

    #[test]
    fn test_parts_assembled_in_order_despite_completion_order() {
        smol::block_on(async {
            let backend = MemoryBackend::object_store();
            backend.delay_part(1, Duration::from_millis(50));
            let retry = RetrySettings::none();
            let cancel = CancellationToken::new();
            let progress = ProgressTracker::disabled("upload");

            let data = content(10);
            let parts = stream::iter(chunk_bytes(data.clone(), 4).into_iter().map(Ok)).boxed();
            let uploaded = job(&backend, &retry, &cancel, &progress).run(parts).await.unwrap();

            assert_eq!(uploaded, 10);
            let log = backend.log();
            assert_eq!(log.completed.len(), 1);
            assert_eq!(log.completed[0].1, vec![1, 2, 3]);
            assert_ne!(log.part_finish_order.first(), Some(&1));
            assert!(log.aborted.is_empty());
            assert_eq!(backend.contents("big.bin"), Some(data));
        });
    }

    #[test]
    fn test_failed_part_aborts_upload() {
        smol::block_on(async {
            let backend = MemoryBackend::object_store();
            backend.fail_part(2);
            let retry = RetrySettings::none();
            let cancel = CancellationToken::new();
            let progress = ProgressTracker::disabled("upload");

            let parts = stream::iter(chunk_bytes(content(40), 4).into_iter().map(Ok)).boxed();
            let err = job(&backend, &retry, &cancel, &progress).run(parts).await.unwrap_err();

            assert_eq!(err.code(), "injected_failure");
            let log = backend.log();
            assert_eq!(log.aborted.len(), 1);
            assert!(log.completed.is_empty());
            assert!(backend.contents("big.bin").is_none());
            assert_eq!(backend.open_uploads(), 0);
            // No part beyond the in-flight window starts after the failure.
            assert!(log.parts_started.len() < 10);
        });
    }

    #[test]
    fn test_cancel_aborts_upload() {
        smol::block_on(async {
            let backend = MemoryBackend::object_store();
            let retry = RetrySettings::none();
            let cancel = CancellationToken::new();
            cancel.cancel();
            let progress = ProgressTracker::disabled("upload");

            let parts = stream::iter(chunk_bytes(content(12), 4).into_iter().map(Ok)).boxed();
            let err = job(&backend, &retry, &cancel, &progress).run(parts).await.unwrap_err();
            assert!(err.is_cancelled());
            assert_eq!(backend.log().aborted.len(), 1);
            assert!(backend.log().parts_started.is_empty());
        });
    }
}
