//! Fixed-window counting with lazy reset.
//!
//! A counter lives for one window. It is never decremented and never swept: the first
//! request that observes `now >= reset_at` replaces it with a fresh window, and the store
//! TTL removes counters nobody touches again.

use crate::clock::Clock;
use crate::error::StoreError;
use crate::rate_limit::store::CounterStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Stored state of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    pub count: u64,
    pub reset_at_millis: u64,
}

impl WindowCounter {
    /// Apply one request to `current`, starting a new window if it is absent or expired.
    pub fn advance(current: Option<WindowCounter>, now_millis: u64, window: Duration) -> Self {
        match current {
            Some(counter) if now_millis < counter.reset_at_millis => WindowCounter {
                count: counter.count.saturating_add(1),
                reset_at_millis: counter.reset_at_millis,
            },
            _ => WindowCounter {
                count: 1,
                reset_at_millis: now_millis
                    .saturating_add(u64::try_from(window.as_millis()).unwrap_or(u64::MAX)),
            },
        }
    }

    /// Time left in the window, at least one millisecond so the store keeps the record.
    pub fn ttl(&self, now_millis: u64) -> Duration {
        Duration::from_millis(self.reset_at_millis.saturating_sub(now_millis).max(1))
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Decode, treating a corrupt record as absent.
    pub fn decode_lenient(key: &str, raw: &[u8]) -> Option<Self> {
        match Self::decode(raw) {
            Ok(counter) => Some(counter),
            Err(e) => {
                tracing::warn!(key, error = %e, "malformed counter record; starting a fresh window");
                None
            }
        }
    }
}

/// Result of counting one request in one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    pub count: u64,
    pub limit: u32,
    pub reset_at_millis: u64,
    /// `count > limit`: the limit-th request passes, the next one does not.
    pub exceeded: bool,
}

impl WindowStatus {
    pub fn remaining(&self) -> u32 {
        u64::from(self.limit).saturating_sub(self.count).try_into().unwrap_or(u32::MAX)
    }
}

/// Counts requests in fixed windows stored in a [`CounterStore`].
///
/// Errors are propagated untouched; whether to fail open is the engine's call.
#[derive(Debug)]
pub struct WindowLimiter<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for WindowLimiter<S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), clock: self.clock.clone() }
    }
}

impl<S> WindowLimiter<S>
where
    S: CounterStore,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Count the current request and report whether it pushed `key` over `limit`.
    pub async fn check_and_increment(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowStatus, StoreError> {
        let now = self.clock.now_millis();
        let counter = self.store.increment(key, window, now).await?;
        Ok(WindowStatus {
            count: counter.count,
            limit,
            reset_at_millis: counter.reset_at_millis,
            exceeded: counter.count > u64::from(limit),
        })
    }
}
