//! Bounded exponential backoff for store calls.
//!
//! The store never retries on its own. The orchestrator wraps each store
//! call with [`RetryPolicy::run`]; only transient failures are
//! retried, and once the attempts are spent the error escalates to the
//! caller, which fails the current tick rather than the run.

use std::future::Future;
use std::time::Duration;

use metrics::counter;

use crate::error::Result;
use crate::metrics::{labels, names};

/// Default number of attempts per store call, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);

/// Default delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

/// Retry policy for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Runs `op`, retrying transient failures with exponential backoff.
    ///
    /// `operation` names the call for logs and the retry counter.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient error
    /// once `max_attempts` is exhausted.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    counter!(names::STORE_RETRIES_TOTAL, labels::OPERATION => operation)
                        .increment(1);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying transient store failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::warn!(operation, attempts = attempt, error = %err, "store retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
