use std::future::Future;
use std::time;

use tracing::warn;

use crate::metrics_consts::RETRIES_TOTAL;

#[derive(Copy, Clone, Debug)]
/// Bounded exponential backoff for transient store and broker errors.
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

/// The operation still failed after the last allowed attempt, or failed with a
/// non-retryable error.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub error: E,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before the retry following the given (1-based) failed attempt.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let candidate_interval = self.initial_interval.saturating_mul(factor);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Run `operation` until it succeeds, fails with an error `is_retryable` rejects,
    /// or runs out of attempts. Sleeps with exponential backoff between attempts.
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: &'static str,
        is_retryable: impl Fn(&E) -> bool,
        mut f: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts && is_retryable(&error) => {
                    let backoff = self.time_until_next_retry(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient error, retrying: {}",
                        error
                    );
                    metrics::counter!(RETRIES_TOTAL, "operation" => operation).increment(1);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RetryError {
                        attempts: attempt,
                        error,
                    })
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(500),
            maximum_interval: Some(time::Duration::from_secs(10)),
        }
    }
}
