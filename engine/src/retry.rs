//! Retry policy with jittered exponential backoff.
//!
//! Lock contention yields `busy` at the primitive layer; retries happen
//! here, at the coordinator layer, with exponential backoff and jitter to
//! spread contending clients apart.

use hotdrop_core::config::EngineConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy for lock acquisition and compensation.
///
/// Delays grow exponentially from `base_delay` up to `max_delay` and are
/// multiplied by a random jitter factor in `[0.5, 1.0]` to avoid a
/// thundering herd of synchronized retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the backoff delay (before jitter).
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Build the policy from engine configuration.
    #[must_use]
    pub const fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: 2.0,
        }
    }

    /// Whether another attempt is allowed after `attempt` (0-indexed)
    /// failures.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Calculate the jittered delay for a given attempt number (0-indexed).
    ///
    /// `delay = min(base_delay · multiplier^attempt, max_delay) · jitter`
    /// with jitter drawn uniformly from `[0.5, 1.0]`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped_secs = base_secs.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);

        Duration::from_secs_f64(capped_secs * jitter)
    }
}

/// Retry an async operation, backing off between attempts, as long as the
/// error satisfies `is_retryable`.
///
/// Returns `Ok(T)` on the first success, or the last error once the policy
/// is exhausted or a non-retryable error is seen.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) || !policy.should_retry(attempt) {
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
