//! Transfer engine.
//!
//! Multi-step work delegated by providers: multipart uploads, batched
//! deletes, single-file transfers and recursive directory transfers, plus
//! the cancellation, progress and retry plumbing they share.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StorageProvider                          │
//! │  - Capability guard, path normalization                     │
//! │  - Builds a TransferContext per call                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//! ┌──────────────────┐ ┌──────────────┐ ┌──────────────────┐
//! │  directory       │ │  file        │ │  batch           │
//! │  walk, run_units │ │  up/down/cp  │ │  delete batches  │
//! └──────────────────┘ └──────────────┘ └──────────────────┘
//!                              │
//!                              ▼
//!              ┌──────────────────────────────┐
//!              │  multipart, retry, progress, │
//!              │  cancel                      │
//!              └──────────────────────────────┘
//! ```

mod batch;
mod cancel;
mod directory;
mod file;
mod multipart;
mod progress;
mod retry;

pub use batch::{BatchDeleteReport, BatchDeleter};
pub use cancel::CancellationToken;
pub use directory::{TransferUnit, Walk};
pub use file::{partial_path, read_all};
pub use multipart::{
    chunk_bytes, chunk_file, chunk_stream, part_count, should_use_multipart, MultipartJob,
    UploadPart,
};
pub use progress::{ProgressCallback, ProgressTracker};
pub use retry::{calculate_backoff, with_retry};

use std::future::Future;

use crate::services::storage::{CapabilitySet, OperationResult, StorageBackend};
use crate::settings::{RetrySettings, TransferSettings};

/// Caller-facing knobs for a long-running call.
#[derive(Clone, Default)]
pub struct TransferOptions {
    pub progress: Option<ProgressCallback>,
    pub cancel: CancellationToken,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("progress", &self.progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Everything one transfer call works with. Paths passed to its methods are
/// already normalized for the backend.
pub struct TransferContext<'a> {
    pub backend: &'a dyn StorageBackend,
    pub capabilities: CapabilitySet,
    /// Settings already clamped to the backend's limits.
    pub settings: &'a TransferSettings,
    pub retry: &'a RetrySettings,
    pub cancel: &'a CancellationToken,
    pub progress: &'a ProgressTracker,
}

impl TransferContext<'_> {
    /// The same context with cancellation detached, for the body of a unit
    /// that has already started.
    pub fn unit(&self) -> TransferContext<'_> {
        TransferContext {
            backend: self.backend,
            capabilities: self.capabilities,
            settings: self.settings,
            retry: self.retry,
            cancel: CancellationToken::uncancellable(),
            progress: self.progress,
        }
    }

    /// Retry one step of a unit in flight. The step is not cancelled.
    pub(crate) async fn step<T, F, Fut>(&self, operation: &str, attempt: F) -> OperationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OperationResult<T>>,
    {
        with_retry(operation, self.retry, CancellationToken::uncancellable(), attempt).await
    }

    pub fn deleter(&self) -> BatchDeleter<'_> {
        BatchDeleter {
            backend: self.backend,
            retry: self.retry,
            cancel: self.cancel,
            progress: self.progress,
        }
    }
}
