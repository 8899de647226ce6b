#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Distributed rate limiting and abuse protection for HTTP services.
//!
//! Every request is attributed to a client (authenticated user or IP), normalized to an
//! endpoint key, and counted in fixed windows kept in a shared [`CounterStore`]. Checks run
//! in tiers and the first violation wins:
//!
//! 1. **Block list**: clients blocked by an earlier violation are rejected outright.
//! 2. **Endpoint tier**: per-minute, per-hour and per-day limits, plus an optional 10-second burst window.
//! 3. **Global tier**: limits across all endpoints; exceeding the hourly one can block the client.
//! 4. **Security tier**: login, password-reset and registration attempts on state-changing methods.
//!
//! Store trouble never takes the service down: any store error or timeout lets the request through.
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{InMemoryCounterStore, RateLimitConfig, RateLimitEngine, RateLimitLayer};
//! use tollgate::config::EndpointRateLimit;
//!
//! let config = RateLimitConfig::default()
//!     .with_endpoint("POST:/auth/login", EndpointRateLimit::new(5, 20, 100).with_burst(3));
//! let engine = RateLimitEngine::new(config, InMemoryCounterStore::new());
//! let layer = RateLimitLayer::new(engine);
//! # let _ = layer;
//! ```
//!
//! Wrap any `tower` HTTP service (an axum `Router`, a hyper service) with the layer. Limited
//! requests get a `429 Too Many Requests` JSON body; allowed ones carry `X-RateLimit-*` headers.

pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod prelude;
pub mod rate_limit;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use classify::{AuthenticatedUser, ClientKey, EndpointKey, PeerAddr};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RateLimitConfig;
pub use error::{ConfigError, StoreError};
pub use rate_limit::block::BlockList;
pub use rate_limit::engine::RateLimitEngine;
pub use rate_limit::store::{CounterStore, InMemoryCounterStore};
pub use rate_limit::window::{WindowCounter, WindowLimiter, WindowStatus};
pub use rate_limit::{Decision, Quota, RateLimitLayer, RateLimitService, Scope, Tier, Window};
pub use telemetry::{AbuseReport, AbuseSink};
pub use timeout::StoreDeadline;
