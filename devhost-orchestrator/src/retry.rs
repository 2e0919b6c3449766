//! Exponential-backoff retry for transient external failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Errors that know whether a retry could help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// `None` retries until the operation stops failing transiently.
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Emit an error-level alert every this many failed attempts (0 disables).
    pub alert_after: u32,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            initial_backoff,
            max_backoff,
            alert_after: 0,
        }
    }

    pub fn unbounded(initial_backoff: Duration, max_backoff: Duration, alert_after: u32) -> Self {
        Self {
            max_attempts: None,
            initial_backoff,
            max_backoff,
            alert_after,
        }
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts the policy.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if let Some(max) = self.max_attempts {
                if attempt >= max {
                    warn!(operation, attempt, error = %err, "giving up after transient failures");
                    return Err(err);
                }
            }

            if self.alert_after > 0 && attempt % self.alert_after == 0 {
                error!(
                    alert = true,
                    operation,
                    attempt,
                    error = %err,
                    "operation still failing, operator attention required"
                );
            } else {
                warn!(operation, attempt, error = %err, "transient failure, retrying");
            }

            tokio::time::sleep(self.backoff_for(attempt)).await;
        }
    }
}
