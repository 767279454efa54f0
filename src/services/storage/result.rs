//! Operation results.
//!
//! Every provider operation returns an [`OperationResult`]. Expected failures
//! (missing paths, denied access, absent capabilities, dropped connections,
//! cancellation) are values, never panics. Failures raised by client
//! libraries are converted once, at the provider boundary, and keep the
//! original error as their `cause`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::types::TransferReport;

/// Outcome tag of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    NotFound,
    PermissionDenied,
    Unimplemented,
    ConnectionFailed,
    Cancelled,
    Error,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Success => "success",
            OperationStatus::NotFound => "not_found",
            OperationStatus::PermissionDenied => "permission_denied",
            OperationStatus::Unimplemented => "unimplemented",
            OperationStatus::ConnectionFailed => "connection_failed",
            OperationStatus::Cancelled => "cancelled",
            OperationStatus::Error => "error",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed operation.
///
/// The status of an `OperationError` is never [`OperationStatus::Success`].
#[derive(Debug, Clone)]
pub struct OperationError {
    status: OperationStatus,
    code: String,
    message: String,
    retryable: bool,
    cause: Option<Arc<anyhow::Error>>,
    report: Option<Box<TransferReport>>,
}

/// Result of every provider operation.
///
/// `Ok` carries the data, `Err` carries the error: data is present exactly
/// when the status is success.
pub type OperationResult<T> = Result<T, OperationError>;

impl OperationError {
    /// Create an error with an explicit status and code.
    pub fn new(status: OperationStatus, code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = if status == OperationStatus::Success {
            OperationStatus::Error
        } else {
            status
        };
        Self {
            status,
            code: code.into(),
            message: message.into(),
            retryable: false,
            cause: None,
            report: None,
        }
    }

    pub fn not_found(path: impl fmt::Display) -> Self {
        Self::new(
            OperationStatus::NotFound,
            "not_found",
            format!("Not found: {}", path),
        )
    }

    pub fn permission_denied(path: impl fmt::Display) -> Self {
        Self::new(
            OperationStatus::PermissionDenied,
            "permission_denied",
            format!("Permission denied: {}", path),
        )
    }

    /// The provider does not declare the capability behind `operation`.
    pub fn unimplemented(operation: &str) -> Self {
        Self::new(
            OperationStatus::Unimplemented,
            "unimplemented",
            format!("Operation '{}' is not supported by this provider", operation),
        )
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(
            OperationStatus::ConnectionFailed,
            "connection_failed",
            message,
        )
        .with_retryable(true)
    }

    pub fn cancelled(operation: &str) -> Self {
        Self::new(
            OperationStatus::Cancelled,
            "cancelled",
            format!("Operation '{}' was cancelled", operation),
        )
    }

    /// Generic failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(OperationStatus::Error, "error", message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(OperationStatus::Error, "invalid_input", message)
    }

    pub fn already_exists(path: impl fmt::Display) -> Self {
        Self::new(
            OperationStatus::Error,
            "already_exists",
            format!("Already exists: {}", path),
        )
    }

    /// Some items of a multi-item operation failed.
    pub fn partially_failed(report: TransferReport) -> Self {
        let message = format!(
            "{}: {} of {} items failed",
            report.operation,
            report.failures.len(),
            report.total_files
        );
        Self::new(OperationStatus::Error, "partially_failed", message).with_report(report)
    }

    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(Arc::new(cause.into()));
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach the aggregated state of a multi-item operation.
    pub fn with_report(mut self, report: TransferReport) -> Self {
        self.report = Some(Box::new(report));
        self
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    pub fn report(&self) -> Option<&TransferReport> {
        self.report.as_deref()
    }

    pub fn into_report(self) -> Option<TransferReport> {
        self.report.map(|r| *r)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == OperationStatus::NotFound
    }

    pub fn is_unimplemented(&self) -> bool {
        self.status == OperationStatus::Unimplemented
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == OperationStatus::Cancelled
    }

    pub fn is_already_exists(&self) -> bool {
        self.code == "already_exists"
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for OperationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|cause| {
            let inner: &(dyn std::error::Error + Send + Sync + 'static) = cause.as_ref();
            inner as &(dyn std::error::Error + 'static)
        })
    }
}

impl From<std::io::Error> for OperationError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let message = err.to_string();
        let mapped = match err.kind() {
            ErrorKind::NotFound => {
                OperationError::new(OperationStatus::NotFound, "not_found", message)
            }
            ErrorKind::PermissionDenied => OperationError::new(
                OperationStatus::PermissionDenied,
                "permission_denied",
                message,
            ),
            ErrorKind::AlreadyExists => {
                OperationError::new(OperationStatus::Error, "already_exists", message)
            }
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => OperationError::connection_failed(message),
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                OperationError::new(OperationStatus::Error, "io_transient", message)
                    .with_retryable(true)
            }
            _ => OperationError::new(OperationStatus::Error, "io_error", message),
        };
        mapped.with_cause(err)
    }
}

/// Field-style view over an [`OperationResult`].
pub trait OperationResultExt<T> {
    fn status(&self) -> OperationStatus;
    fn data(&self) -> Option<&T>;
    fn error(&self) -> Option<&OperationError>;
}

impl<T> OperationResultExt<T> for OperationResult<T> {
    fn status(&self) -> OperationStatus {
        match self {
            Ok(_) => OperationStatus::Success,
            Err(e) => e.status(),
        }
    }

    fn data(&self) -> Option<&T> {
        self.as_ref().ok()
    }

    fn error(&self) -> Option<&OperationError> {
        self.as_ref().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_never_success() {
        let err = OperationError::new(OperationStatus::Success, "weird", "should not happen");
        assert_eq!(err.status(), OperationStatus::Error);
    }

    #[test]
    fn test_data_and_error_are_exclusive() {
        let ok: OperationResult<u32> = Ok(7);
        assert_eq!(ok.status(), OperationStatus::Success);
        assert_eq!(ok.data(), Some(&7));
        assert!(ok.error().is_none());

        let failed: OperationResult<u32> = Err(OperationError::not_found("a.txt"));
        assert_eq!(failed.status(), OperationStatus::NotFound);
        assert!(failed.data().is_none());
        assert!(failed.error().is_some());
    }

    #[test]
    fn test_connection_failed_is_retryable() {
        assert!(OperationError::connection_failed("dropped").is_retryable());
        assert!(!OperationError::permission_denied("/etc").is_retryable());
        assert!(!OperationError::not_found("/nope").is_retryable());
    }

    #[test]
    fn test_io_error_mapping_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = OperationError::from(io);
        assert_eq!(err.status(), OperationStatus::NotFound);
        assert!(err.cause().is_some());
        assert!(std::error::Error::source(&err).is_some());

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = OperationError::from(reset);
        assert_eq!(err.status(), OperationStatus::ConnectionFailed);
        assert!(err.is_retryable());
    }
}
