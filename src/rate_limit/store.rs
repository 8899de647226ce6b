use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::StoreError;
use crate::rate_limit::window::WindowCounter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Abstract storage interface for counters and block markers.
///
/// Values are opaque bytes with a TTL; stale entries are expected to expire on their own.
/// The store is the only shared mutable state, so it must be safe to use from every
/// service instance at once.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Fetch the raw value for a key, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite a key. The value must disappear after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Count one request against the fixed window stored at `key`.
    ///
    /// The provided implementation is a plain read-modify-write over [`get`](Self::get) and
    /// [`set`](Self::set). It is not atomic across instances: two concurrent callers can
    /// read the same count and both write `count + 1`, so enforcement may run a little
    /// loose under contention but never tighter than configured. Backends with an atomic
    /// increment-with-expiry primitive should override this.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now_millis: u64,
    ) -> Result<WindowCounter, StoreError> {
        let current = self.get(key).await?.and_then(|raw| WindowCounter::decode_lenient(key, &raw));
        let next = WindowCounter::advance(current, now_millis, window);
        self.set(key, next.encode()?, next.ttl(now_millis)).await?;
        Ok(next)
    }
}

#[async_trait]
impl<T> CounterStore for Arc<T>
where
    T: CounterStore + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, value, ttl).await
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now_millis: u64,
    ) -> Result<WindowCounter, StoreError> {
        (**self).increment(key, window, now_millis).await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: u64,
}

/// Writes between two sweeps of expired entries.
pub const SWEEP_INTERVAL: u64 = 1024;

/// Process-local counter store with lazy TTL expiry.
///
/// Expired entries are dropped when their key is read, and every [`SWEEP_INTERVAL`]
/// writes the whole map is swept, so memory tracks live clients rather than every client
/// ever seen. Suitable for single-instance deployments and tests. Clones share the same
/// data.
#[derive(Clone, Debug)]
pub struct InMemoryCounterStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
    writes: Arc<AtomicU64>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Use an explicit clock for TTL expiry (share it with the engine in tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(clock),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every expired entry now instead of waiting for the next sweep.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        Self::sweep(&mut self.lock(), now)
    }

    fn sweep(guard: &mut HashMap<String, Entry>, now: u64) -> usize {
        let before = guard.len();
        guard.retain(|_, entry| entry.expires_at > now);
        let removed = before - guard.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = guard.len(), "swept expired counters");
        }
        removed
    }

    /// Insert under an already held lock, sweeping on every `SWEEP_INTERVAL`th write.
    fn insert_entry(
        &self,
        guard: &mut HashMap<String, Entry>,
        key: &str,
        entry: Entry,
        now: u64,
    ) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            Self::sweep(guard, now);
        }
        guard.insert(key.to_string(), entry);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live_value(
        guard: &mut HashMap<String, Entry>,
        key: &str,
        now: u64,
    ) -> Option<Vec<u8>> {
        match guard.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        Ok(Self::live_value(&mut guard, key, now))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        self.insert_entry(&mut self.lock(), key, Entry { value, expires_at }, now);
        Ok(())
    }

    /// Same algorithm as the provided method, but under one lock so it is exact in-process.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now_millis: u64,
    ) -> Result<WindowCounter, StoreError> {
        let store_now = self.clock.now_millis();
        let mut guard = self.lock();
        let current = Self::live_value(&mut guard, key, store_now)
            .and_then(|raw| WindowCounter::decode_lenient(key, &raw));
        let next = WindowCounter::advance(current, now_millis, window);
        let expires_at = store_now.saturating_add(duration_millis(next.ttl(now_millis)));
        let entry = Entry { value: next.encode()?, expires_at };
        self.insert_entry(&mut guard, key, entry, store_now);
        Ok(next)
    }
}

/// Refuses every call, for checking that errors surface unchanged.
#[cfg(test)]
pub(crate) struct UnavailableStore;

#[cfg(test)]
#[async_trait]
impl CounterStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}
