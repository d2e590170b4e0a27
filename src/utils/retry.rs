//! Exponential backoff for provider calls.

use anyhow::{Result, anyhow};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff multiplier is capped at 5x the base delay so a generous retry
/// budget cannot stall a scrape: 1, 2, 4, 5, 5, ...
const MAX_BACKOFF_FACTOR: u32 = 5;

/// Delay before the retry following `attempt` (zero-based).
pub fn backoff_delay(base_delay: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt)
        .unwrap_or(MAX_BACKOFF_FACTOR)
        .min(MAX_BACKOFF_FACTOR);
    base_delay * factor
}

/// Run `operation` up to `max_retries + 1` times, sleeping between attempts.
///
/// Cancellation during a backoff sleep aborts immediately with the
/// cancellation error rather than finishing the retry budget.
///
/// # Errors
///
/// Returns the last operation error once retries are exhausted, or a
/// cancellation error if `cancel` fires during a sleep.
pub async fn with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    mut operation: F,
    max_retries: u32,
    base_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_retries => return Err(err),
            Err(err) => {
                let delay = backoff_delay(base_delay, attempt);
                debug!(attempt, ?delay, "retrying after error: {err:#}");

                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(anyhow!("operation cancelled during retry backoff"));
                    }
                    () = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
        }
    }
}
