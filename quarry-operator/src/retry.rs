//! Bounded retry of optimistic concurrency writes.
//!
//! Every mutating write of the engine is a read-modify-write cycle. A conflict means that the
//! object changed between our read and our write, so the whole cycle is retried with exponential
//! backoff and jitter. Any other error is returned immediately.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;

use quarry_core::Result;

/// Backoff configuration for conflict retries.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Each delay is scaled by a random factor in `1 +/- randomization_factor`.
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            randomization_factor: 0.5,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts.
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Build the backoff schedule used between attempts.
    ///
    /// Elapsed time is not bounded, the attempt count is.
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: self.randomization_factor,
            multiplier: self.backoff_multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Run the given read-modify-write operation, retrying it while it fails with a conflict.
pub async fn retry_on_conflict<F, Fut, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    backoff::future::retry_notify(
        config.backoff(),
        || {
            attempt += 1;
            let last = attempt >= max_attempts;
            let fut = operation();
            async move {
                fut.await.map_err(|err| match err.is_conflict() {
                    true if !last => backoff::Error::transient(err),
                    true => {
                        tracing::warn!(operation = %operation_name, attempts = max_attempts, "write conflict persisted after max retries");
                        backoff::Error::permanent(err)
                    }
                    false => backoff::Error::permanent(err),
                })
            }
        },
        |err: quarry_core::Error, delay: Duration| {
            tracing::debug!(operation = %operation_name, error = ?err, delay_ms = delay.as_millis() as u64, "write conflict, retrying");
        },
    )
    .await
}
