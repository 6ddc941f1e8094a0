//! Retry a transactional unit of work on transient write conflicts
//!
//! [`retry_on_conflict`] knows nothing about drivers. The operation it drives
//! must be a complete transaction (begin, body, commit) so that re-running it
//! after a conflict repeats nothing outside the transaction boundary; errors
//! the classifier does not recognise as conflicts propagate on the first
//! occurrence.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Bounds for conflict retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max.max(initial);
        self
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or
/// exhausts `policy.max_attempts`.
///
/// `operation` receives the 1-based attempt number.
pub async fn retry_on_conflict<T, E, F, Fut, C>(
    policy: RetryPolicy,
    mut operation: F,
    is_conflict: C,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !is_conflict(&err) => return Err(err),
            Err(err) if attempt >= policy.max_attempts => {
                tracing::error!(attempt, error = %err, "write conflict persisted, giving up");
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "write conflict, retrying transaction"
                );
                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}
