//! Error types for the counter store and configuration loading.
//!
//! Rate-limit violations are not errors: they surface as
//! [`Decision::Limited`](crate::rate_limit::Decision::Limited).
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the counter store.
///
/// The engine treats every variant the same way (fail open); the distinction only matters
/// for logs.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, pool exhausted, ...).
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The call did not finish within the request-scoped deadline.
    #[error("counter store call timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    /// A record could not be serialized for writing.
    #[error("counter record codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// Backend-specific failure.
    #[error("counter store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap a backend error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }

    /// Check if this error is due to the store deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors produced when loading or validating a [`RateLimitConfig`](crate::RateLimitConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read rate limit config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rate limit config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid rate limit config at {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { field: field.into(), reason: reason.into() }
    }
}
