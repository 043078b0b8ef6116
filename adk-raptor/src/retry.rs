//! Bounded retry with exponential backoff and per-call timeouts.
//!
//! Every call to an external capability goes through a [`RetryPolicy`]:
//! each attempt is wrapped in a timeout, transient failures are retried after
//! `base * 2^(attempt - 1)` (capped), and the last error is returned once the
//! attempts are spent.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{RaptorError, Result};

/// Retry policy applied to embedding and generation calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create a policy from configuration.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Total attempts per call.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// `name` labels the call in logs and in [`RaptorError::Timeout`].
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt, or immediately the first
    /// non-retryable error.
    pub async fn run<F, Fut, T>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match timeout(self.timeout, operation()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RaptorError::Timeout {
                    operation: name.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "capability call failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
