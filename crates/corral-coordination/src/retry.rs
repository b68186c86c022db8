//! Per-call timeouts and fixed-delay retry of transient failures.

use std::future::Future;
use std::time::Duration;

use corral_core::StoreError;
use tracing::debug;
use tracing::warn;

use crate::error::CoordinationError;

/// Run one store call under `timeout`.
pub async fn with_timeout<T, Fut>(operation: &str, timeout: Duration, call: Fut) -> Result<T, CoordinationError>
where
    Fut: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(CoordinationError::from),
        Err(_) => Err(CoordinationError::Timeout {
            operation: operation.to_string(),
            duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Fixed-delay retry for single-key writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRetry {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl WriteRetry {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only transient failures (connection loss, timeouts) are retried. The
    /// last error is returned when every attempt failed.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, CoordinationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoordinationError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    warn!(operation, attempt, error = %err, "transient failure, retrying");
                    tokio::time::sleep(self.delay).await;
                    debug!(operation, attempt = attempt + 1, "retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
