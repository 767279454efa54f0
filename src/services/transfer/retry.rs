//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::cancel::CancellationToken;
use crate::services::storage::OperationResult;
use crate::settings::RetrySettings;

/// Calculate backoff delay for a given retry attempt (exponential backoff)
pub fn calculate_backoff(attempt: u32, settings: &RetrySettings) -> Duration {
    let delay_ms = (settings.initial_backoff_ms as f64
        * settings.backoff_multiplier.powi(attempt as i32))
    .min(settings.max_backoff_ms as f64)
    .max(0.0);

    Duration::from_millis(delay_ms as u64)
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent.
///
/// Cancellation is checked before every attempt and after every backoff
/// sleep.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    settings: &RetrySettings,
    cancel: &CancellationToken,
    mut attempt: F,
) -> OperationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OperationResult<T>>,
{
    let mut retries = 0u32;
    loop {
        cancel.check(operation)?;

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retries < settings.max_retries => {
                let delay = calculate_backoff(retries, settings);
                retries += 1;
                debug!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    retries,
                    settings.max_retries + 1,
                    delay,
                    e
                );
                if !delay.is_zero() {
                    smol::Timer::after(delay).await;
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!("{} failed after {} retries: {}", operation, retries, e);
                }
                return Err(e);
            }
        }
    }
}
