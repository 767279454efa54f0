//! Batched deletes.
//!
//! Keys are grouped into batches no larger than the backend's per-request
//! limit, so K keys with cap C cost `ceil(K / C)` requests. Outcomes are
//! tracked per key: a key that fails does not stop the rest of its batch or
//! later batches, and keys already deleted are never restored.

use serde::Serialize;
use tracing::{debug, warn};

use super::cancel::CancellationToken;
use super::progress::ProgressTracker;
use super::retry::with_retry;
use crate::services::storage::{ItemFailure, StorageBackend};
use crate::settings::RetrySettings;

/// Per-key outcome of a multi-key delete.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDeleteReport {
    /// Batch requests issued. Zero when keys were deleted one by one.
    pub batches: usize,
    pub deleted: Vec<String>,
    pub failed: Vec<ItemFailure>,
    /// Keys never attempted because cancellation fired first.
    pub skipped: Vec<String>,
    pub cancelled: bool,
}

impl BatchDeleteReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

pub struct BatchDeleter<'a> {
    pub backend: &'a dyn StorageBackend,
    pub retry: &'a RetrySettings,
    pub cancel: &'a CancellationToken,
    pub progress: &'a ProgressTracker,
}

impl BatchDeleter<'_> {
    /// Delete `keys` in batches of at most `cap`.
    pub async fn delete_batched(&self, keys: &[String], cap: usize) -> BatchDeleteReport {
        let cap = cap.max(1);
        let mut report = BatchDeleteReport::default();
        let mut chunks = keys.chunks(cap);

        while let Some(chunk) = chunks.next() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                report.skipped.extend(chunk.iter().cloned());
                for rest in chunks.by_ref() {
                    report.skipped.extend(rest.iter().cloned());
                }
                break;
            }

            report.batches += 1;
            debug!("Deleting batch {} ({} keys)", report.batches, chunk.len());
            let outcome = with_retry("delete_batch", self.retry, self.cancel, || {
                self.backend.delete_batch(chunk)
            })
            .await;

            match outcome {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome.result {
                            Ok(()) => {
                                self.progress.file_done(&outcome.key);
                                report.deleted.push(outcome.key);
                            }
                            Err(e) => report.failed.push(ItemFailure::new(outcome.key, &e)),
                        }
                    }
                }
                Err(e) if e.is_cancelled() => {
                    report.cancelled = true;
                    report.skipped.extend(chunk.iter().cloned());
                }
                Err(e) => {
                    warn!("Batch delete of {} keys failed: {}", chunk.len(), e);
                    report
                        .failed
                        .extend(chunk.iter().map(|key| ItemFailure::new(key.clone(), &e)));
                }
            }
        }

        report
    }

    /// Delete `keys` one request at a time.
    pub async fn delete_each(&self, keys: &[String]) -> BatchDeleteReport {
        let mut report = BatchDeleteReport::default();

        for (i, key) in keys.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                report.skipped.extend(keys[i..].iter().cloned());
                break;
            }
            let result = with_retry("delete", self.retry, self.cancel, || {
                self.backend.delete(key)
            })
            .await;
            match result {
                Ok(()) => {
                    self.progress.file_done(key);
                    report.deleted.push(key.clone());
                }
                Err(e) if e.is_cancelled() => {
                    report.cancelled = true;
                    report.skipped.extend(keys[i..].iter().cloned());
                    break;
                }
                Err(e) => report.failed.push(ItemFailure::new(key.clone(), &e)),
            }
        }

        report
    }
}
