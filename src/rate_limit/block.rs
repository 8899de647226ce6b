//! Time-bounded client blocks.
//!
//! A block is a store entry with a TTL equal to its duration. There is no unblock: an
//! entry either expires in the store or is observed past `blocked_until` and ignored.

use crate::classify::ClientKey;
use crate::clock::{duration_millis, Clock};
use crate::error::StoreError;
use crate::rate_limit::store::CounterStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub blocked_until_millis: u64,
}

pub struct BlockList<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl<S> BlockList<S>
where
    S: CounterStore,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        Self { store, clock, prefix: prefix.into() }
    }

    fn key(&self, client: &ClientKey) -> String {
        format!("{}:block:{}", self.prefix, client)
    }

    /// `Some(blocked_until_millis)` while a block is active.
    pub async fn is_blocked(&self, client: &ClientKey) -> Result<Option<u64>, StoreError> {
        let key = self.key(client);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let entry: BlockEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "malformed block record; treating client as unblocked");
                return Ok(None);
            }
        };
        let now = self.clock.now_millis();
        Ok((now < entry.blocked_until_millis).then_some(entry.blocked_until_millis))
    }

    /// Block `client` for `duration`. Returns the expiry in epoch milliseconds.
    pub async fn block(&self, client: &ClientKey, duration: Duration) -> Result<u64, StoreError> {
        let blocked_until_millis = self.clock.now_millis().saturating_add(duration_millis(duration));
        let raw = serde_json::to_vec(&BlockEntry { blocked_until_millis })?;
        self.store.set(&self.key(client), raw, duration).await?;
        tracing::info!(client = %client, until_ms = blocked_until_millis, "client blocked");
        Ok(blocked_until_millis)
    }
}
