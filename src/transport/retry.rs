//! Transport call retry with exponential backoff.
//!
//! Only transient failures (`TransportError::Network`) are retried. Protocol,
//! decryption and closed-session errors are returned on the first attempt.

use super::traits::TransportError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Backoff schedule: `base * 2^attempt`, capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Retry an async operation with exponential backoff.
///
/// # Example
///
/// ```no_run
/// use switchboard::transport::retry::{retry_with_backoff, is_transport_error_retryable, RetryPolicy};
/// use switchboard::transport::TransportError;
///
/// async fn fetch() -> Result<(), TransportError> {
///     retry_with_backoff(
///         RetryPolicy::default(),
///         || async { /* transport call */ Ok(()) },
///         is_transport_error_retryable,
///     )
///     .await
/// }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable(&err) || attempt >= policy.max_retries {
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "transport call failed, retrying"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Retry only network errors.
pub fn is_transport_error_retryable(err: &TransportError) -> bool {
    matches!(err, TransportError::Network(_))
}
