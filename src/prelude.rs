//! Convenient re-exports for common Tollgate types.
pub use crate::{
    classify::{derive_client_key, normalize_endpoint, should_skip, EndpointClass},
    config::{DefaultLimits, EndpointRateLimit, GlobalRateLimit, SecurityRateLimit},
    telemetry::{LogSink, MemorySink, NonBlockingSink, NullSink},
    AbuseReport, AbuseSink, ClientKey, CounterStore, Decision, EndpointKey, InMemoryCounterStore,
    RateLimitConfig, RateLimitEngine, RateLimitLayer, StoreError,
};
