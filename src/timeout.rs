//! Request-scoped deadline for counter store calls.
//!
//! Dropping the wrapped future cancels every in-flight store call. Each write the limiter
//! issues is a complete record, so a cancelled evaluation never leaves a half-written counter.

use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;

/// Default budget for one full evaluation (all tiers, all store round trips).
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct StoreDeadline {
    duration: Duration,
}

impl StoreDeadline {
    /// Create a deadline. Zero falls back to [`DEFAULT_STORE_TIMEOUT`].
    pub fn new(duration: Duration) -> Self {
        let duration = if duration.is_zero() { DEFAULT_STORE_TIMEOUT } else { duration };
        Self { duration }
    }

    /// Inspect the configured deadline.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, Fut>(&self, operation: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.duration, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout { timeout: self.duration }),
        }
    }
}

impl Default for StoreDeadline {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_TIMEOUT)
    }
}
