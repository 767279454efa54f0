//! Cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::services::storage::{OperationError, OperationResult};

/// Cancellation signal threaded through long-running calls.
///
/// Clones share the same flag. The engine checks it between units of work
/// (parts, batches, directory entries); a unit already in flight runs to
/// completion.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Option<Arc<AtomicBool>>,
}

static UNCANCELLABLE: CancellationToken = CancellationToken { cancelled: None };

impl Default for CancellationToken {
    fn default() -> Self {
        Self {
            cancelled: Some(Arc::new(AtomicBool::new(false))),
        }
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that never fires. Steps inside a unit that has already
    /// started run against it.
    pub fn uncancellable() -> &'static CancellationToken {
        &UNCANCELLABLE
    }

    pub fn cancel(&self) {
        if let Some(flag) = &self.cancelled {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// `Err(Cancelled)` once the token has fired.
    pub fn check(&self, operation: &str) -> OperationResult<()> {
        if self.is_cancelled() {
            Err(OperationError::cancelled(operation))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::OperationStatus;

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(observer.check("copy").is_ok());
        token.cancel();
        assert!(observer.is_cancelled());
        assert_eq!(
            observer.check("copy").unwrap_err().status(),
            OperationStatus::Cancelled
        );
    }

    #[test]
    fn test_uncancellable_ignores_cancel() {
        let token = CancellationToken::uncancellable();
        token.cancel();
        assert!(!token.is_cancelled());
        assert!(token.check("delete").is_ok());
    }
}
