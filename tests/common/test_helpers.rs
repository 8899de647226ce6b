#![allow(dead_code)]

use async_trait::async_trait;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tollgate::telemetry::{AbuseSink, MemorySink};
use tollgate::{
    AbuseReport, CounterStore, InMemoryCounterStore, ManualClock, RateLimitConfig,
    RateLimitEngine, StoreError,
};

/// Any tracing output goes to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Engine on a fresh in-memory store sharing `clock`, reporting into a [`MemorySink`].
pub fn memory_engine(
    config: RateLimitConfig,
    clock: &ManualClock,
) -> (RateLimitEngine<Arc<InMemoryCounterStore>, MemorySink>, Arc<InMemoryCounterStore>, MemorySink)
{
    let store = Arc::new(InMemoryCounterStore::with_clock(clock.clone()));
    let sink = MemorySink::new();
    let engine = RateLimitEngine::new(config, store.clone())
        .with_clock(clock.clone())
        .with_sink(sink.clone());
    (engine, store, sink)
}

/// Fails every call and counts how often it was asked.
#[derive(Debug, Default, Clone)]
pub struct FailingStore {
    pub calls: Arc<AtomicUsize>,
}

impl FailingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

/// Delegates to an in-memory store after sleeping on every call.
#[derive(Debug, Clone)]
pub struct SlowStore {
    pub inner: InMemoryCounterStore,
    pub delay: Duration,
}

#[async_trait]
impl CounterStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.set(key, value, ttl).await
    }
}

/// Rejects every report.
#[derive(Debug, Default, Clone)]
pub struct BrokenSink {
    pub attempts: Arc<AtomicUsize>,
}

impl tower::Service<AbuseReport> for BrokenSink {
    type Response = ();
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _report: AbuseReport) -> Self::Future {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "audit down")) })
    }
}

impl AbuseSink for BrokenSink {
    type SinkError = std::io::Error;
}

/// Response type used by the `service_fn` backends in the middleware tests.
pub type TestResponse = http::Response<String>;

pub async fn ok_backend(_req: http::Request<String>) -> Result<TestResponse, Infallible> {
    Ok(http::Response::new("ok".to_string()))
}
