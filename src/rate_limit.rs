//! Tiered rate limiting.
//!
//! This module provides the building blocks for rate limiting:
//! - [`CounterStore`](store::CounterStore): the shared key-value store holding every counter
//!   and block marker.
//! - [`WindowLimiter`](window::WindowLimiter): fixed windows with lazy reset.
//! - [`BlockList`](block::BlockList): time-bounded client blocks.
//! - [`RateLimitEngine`](engine::RateLimitEngine): runs the block check and the endpoint,
//!   global and security tiers, and decides to fail open on store errors.
//! - [`RateLimitLayer`]: tower middleware producing `429` responses and
//!   `X-RateLimit-*` headers.
//!
//! # Architecture
//!
//! - **Middleware**: `RateLimitLayer` classifies the request and asks the engine. It does
//!   not know how limits work.
//! - **Engine**: owns the immutable config and the tier order. It is the only place that
//!   swallows store errors.
//! - **Limiter / Block list**: strict components that propagate every store error.
//! - **Storage**: `CounterStore` holds all mutable state, so any number of service
//!   instances can share one store (e.g. Redis via `tollgate-redis`).

use std::fmt;
use std::time::Duration;

pub mod block;
pub mod engine;
pub mod middleware;
pub mod store;
pub mod window;

pub use middleware::{RateLimitLayer, RateLimitService};

/// Counter window kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    /// 10-second burst window.
    Burst,
    Minute,
    Hour,
    Day,
}

impl Window {
    pub fn duration(self) -> Duration {
        match self {
            Window::Burst => Duration::from_secs(10),
            Window::Minute => Duration::from_secs(60),
            Window::Hour => Duration::from_secs(60 * 60),
            Window::Day => Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Window::Burst => "burst",
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }
}

/// What a counter is scoped to, in addition to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One normalized endpoint.
    Endpoint,
    /// Every request from the client.
    Global,
    Login,
    PasswordReset,
    Registration,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Endpoint => "endpoint",
            Scope::Global => "global",
            Scope::Login => "login",
            Scope::PasswordReset => "password_reset",
            Scope::Registration => "registration",
        }
    }
}

/// Why a request was limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// The client is under an active block.
    Blocked,
    /// A window in one of the counting tiers was exceeded.
    Limit { scope: Scope, window: Window },
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Blocked => f.write_str("blocked"),
            Tier::Limit { scope, window } => write!(f, "{}:{}", scope.as_str(), window.as_str()),
        }
    }
}

/// Allowance for one window, as reported in `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u32,
    pub remaining: u32,
    /// Unix epoch milliseconds at which the window resets (or the block ends).
    pub reset_at_millis: u64,
}

impl Quota {
    /// Reset time as Unix seconds, rounded up.
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at_millis.div_ceil(1000)
    }
}

/// The outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Tightest applicable window. `None` when the engine failed open.
        quota: Option<Quota>,
    },
    /// The request must be rejected with `429`.
    Limited {
        tier: Tier,
        quota: Quota,
        /// How long the caller should wait. Useful for `Retry-After` headers.
        retry_after: Option<Duration>,
    },
}

impl Decision {
    pub fn is_limited(&self) -> bool {
        matches!(self, Decision::Limited { .. })
    }

    pub fn is_allowed(&self) -> bool {
        !self.is_limited()
    }

    pub fn quota(&self) -> Option<&Quota> {
        match self {
            Decision::Allowed { quota } => quota.as_ref(),
            Decision::Limited { quota, .. } => Some(quota),
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Limited { tier, .. } => Some(*tier),
        }
    }
}
