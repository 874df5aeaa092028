//! Boundary retries of transient queue failures.

use std::future::Future;

use crate::config::RetryConfig;
use crate::infrastructure::resilience::{BackoffConfig, ExponentialBackoff};
use crate::metrics::OperationMetrics;
use crate::queue::QueueError;

/// How often and how patiently a request retries a failing operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffConfig,
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt; zero is treated as one.
    pub fn new(max_attempts: u32, backoff: BackoffConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, BackoffConfig::from(config))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fresh backoff sequence for one request.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::with_config(self.backoff.clone())
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. The last error is returned.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut f: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 1;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = backoff.next_delay();
                    OperationMetrics::record_retry(operation, e.kind());
                    tracing::warn!(
                        operation = %operation,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying queue operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
