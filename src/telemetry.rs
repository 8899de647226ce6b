//! Abuse reporting.
//!
//! When a client trips a tier the engine emits an [`AbuseReport`] through an [`AbuseSink`].
//! Sinks are `tower::Service`s so they compose with standard tower combinators and can
//! forward to any audit backend (see the `tollgate-jsonl` crate for a file-based one).
//!
//! Delivery is best-effort: a failing or slow sink must never change the outcome of the
//! request being throttled. Wrap slow sinks in [`NonBlockingSink`] to keep them off the
//! request path entirely.
//!
//! ```rust
//! use tollgate::telemetry::{AbuseReport, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let report = AbuseReport {
//!     client_key: "ip:203.0.113.7".into(),
//!     endpoint_key: "POST:/auth/login".into(),
//!     reason: "login:hour".into(),
//!     detail: "21 requests against a limit of 20".into(),
//!     at_millis: 1_700_000_000_000,
//! };
//! sink.call(report.clone()).await.unwrap();
//! assert_eq!(sink.reports(), vec![report]);
//! # }
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc::error::TrySendError;
use tower::Service;

/// A suspicious-activity event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbuseReport {
    pub client_key: String,
    pub endpoint_key: String,
    /// Name of the violated tier, e.g. `global:hour`.
    pub reason: String,
    /// Human readable context (counts, block duration).
    pub detail: String,
    /// Unix epoch milliseconds.
    pub at_millis: u64,
}

impl fmt::Display for AbuseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Abuse(client={}, endpoint={}, reason={}, detail={})",
            self.client_key, self.endpoint_key, self.reason, self.detail
        )
    }
}

/// A sink that consumes abuse reports.
pub trait AbuseSink:
    tower::Service<AbuseReport, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, report: AbuseReport)
where
    S: tower::Service<AbuseReport, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    match sink.ready_oneshot().await {
        Ok(mut ready_sink) => {
            if let Err(e) = ready_sink.call(report).await {
                tracing::warn!(error = %e, "abuse report delivery failed");
            }
        }
        Err(e) => tracing::debug!(error = %e, "abuse sink not ready; report dropped"),
    }
}

/// Discards every report.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AbuseReport> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _report: AbuseReport) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl AbuseSink for NullSink {
    type SinkError = Infallible;
}

/// Logs each report at WARN level with structured fields.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AbuseReport> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, report: AbuseReport) -> Self::Future {
        tracing::warn!(
            client = %report.client_key,
            endpoint = %report.endpoint_key,
            reason = %report.reason,
            detail = %report.detail,
            at_ms = report.at_millis,
            "suspicious_activity"
        );
        Box::pin(async { Ok(()) })
    }
}

impl AbuseSink for LogSink {
    type SinkError = Infallible;
}

/// Stores reports in memory. Bounded; the oldest report is evicted first.
#[derive(Clone, Debug)]
pub struct MemorySink {
    reports: Arc<Mutex<VecDeque<AbuseReport>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            reports: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of everything received so far.
    pub fn reports(&self) -> Vec<AbuseReport> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of reports dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AbuseReport>> {
        self.reports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AbuseReport> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, report: AbuseReport) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(report);
        Box::pin(async { Ok(()) })
    }
}

impl AbuseSink for MemorySink {
    type SinkError = Infallible;
}

/// Hands reports to a background worker over a bounded queue, so the request that
/// tripped a limit never waits on the audit backend.
///
/// A full queue means the backend is falling behind during an attack. The report is then
/// dropped and counted, and a warning still names its client and tier. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<AbuseReport>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    /// Spawn the worker that drains up to `capacity` queued reports into `sink`.
    pub fn with_capacity<S>(mut sink: S, capacity: usize) -> Self
    where
        S: AbuseSink,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<AbuseReport>(capacity.max(1));
        tokio::spawn(async move {
            use tower::ServiceExt;
            while let Some(report) = rx.recv().await {
                let client = report.client_key.clone();
                let delivered = match sink.ready().await {
                    Ok(ready) => ready.call(report).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = delivered {
                    tracing::warn!(client = %client, error = %e, "abuse report delivery failed");
                }
            }
            tracing::debug!("abuse report queue closed");
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Reports lost to a full or closed queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self, report: &AbuseReport, cause: &'static str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            client = %report.client_key,
            endpoint = %report.endpoint_key,
            reason = %report.reason,
            cause,
            dropped_total = total,
            "abuse report dropped"
        );
    }
}

impl Service<AbuseReport> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, report: AbuseReport) -> Self::Future {
        match self.tx.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => self.record_drop(&report, "queue full"),
            Err(TrySendError::Closed(report)) => self.record_drop(&report, "worker stopped"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl AbuseSink for NonBlockingSink {
    type SinkError = Infallible;
}
