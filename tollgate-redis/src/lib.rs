//! Redis counter store for `tollgate`.
//!
//! Counters and block markers are plain string keys with a millisecond TTL, so every
//! service instance pointed at the same Redis shares one view of each client. Window
//! increments run as a single Lua script, which makes them exact across instances.
//!
//! ```rust,no_run
//! use tollgate::{RateLimitConfig, RateLimitEngine};
//! use tollgate_redis::RedisCounterStore;
//!
//! # async fn demo() -> Result<(), tollgate::StoreError> {
//! let store = RedisCounterStore::connect("redis://127.0.0.1:6379").await?;
//! let engine = RateLimitEngine::new(RateLimitConfig::default(), store);
//! # let _ = engine;
//! # Ok(()) }
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tollgate::{CounterStore, StoreError, WindowCounter};

// Same lazy-reset rule as `WindowCounter::advance`, evaluated server-side. The record
// layout matches what `get`/`set` callers read and write.
const INCREMENT_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local count = 1
local reset_at = now + window
local raw = redis.call('GET', KEYS[1])
if raw then
  local ok, record = pcall(cjson.decode, raw)
  if ok and type(record) == 'table' then
    local stored_count = tonumber(record.count)
    local stored_reset = tonumber(record.reset_at_millis)
    if stored_count and stored_reset and now < stored_reset then
      count = stored_count + 1
      reset_at = stored_reset
    end
  end
end
local ttl = reset_at - now
if ttl < 1 then ttl = 1 end
redis.call('SET', KEYS[1], cjson.encode({count = count, reset_at_millis = reset_at}), 'PX', ttl)
return {count, reset_at}
";

/// [`CounterStore`] backed by Redis through a reconnecting [`ConnectionManager`].
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    key_prefix: Option<String>,
    increment_script: Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").field("key_prefix", &self.key_prefix).finish()
    }
}

impl RedisCounterStore {
    /// Connect to Redis at `redis_url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        tracing::debug!("connected to redis counter store");
        Ok(Self::from_manager(conn))
    }

    /// Reuse a connection the application already manages.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn, key_prefix: None, increment_script: Script::new(INCREMENT_SCRIPT) }
    }

    /// Prepend `prefix:` to every key, for Redis instances shared with other data.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    fn key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> =
            redis::cmd("GET").arg(self.key(key)).query_async(&mut conn).await.map_err(store_error)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now_millis: u64,
    ) -> Result<WindowCounter, StoreError> {
        let mut conn = self.conn.clone();
        let window_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let (count, reset_at_millis): (u64, u64) = self
            .increment_script
            .key(self.key(key))
            .arg(now_millis)
            .arg(window_millis)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(WindowCounter { count, reset_at_millis })
    }
}

fn store_error(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Unavailable(err.to_string())
    } else if err.is_timeout() {
        StoreError::Unavailable(format!("redis timeout: {err}"))
    } else {
        StoreError::backend(err)
    }
}
