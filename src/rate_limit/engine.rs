//! The tiered decision engine.
//!
//! Order of evaluation, first violation wins:
//! 1. active block for the client (no counters are touched while blocked)
//! 2. endpoint tier: minute, hour, day, then the 10s burst window if enabled
//! 3. global tier: minute, hour (hour escalates to a block when IP blocking is on)
//! 4. security tier for login / password reset / registration routes (login hour escalates)
//!
//! [`RateLimitEngine::evaluate`] is the single place store failures are absorbed: the
//! window limiter and block list propagate every error, and the engine turns them into an
//! allowed decision.

use crate::classify::{ClientKey, EndpointKey, SecurityOperation};
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::error::StoreError;
use crate::rate_limit::block::BlockList;
use crate::rate_limit::store::CounterStore;
use crate::rate_limit::window::{WindowLimiter, WindowStatus};
use crate::rate_limit::{Decision, Quota, Scope, Tier, Window};
use crate::telemetry::{emit_best_effort, AbuseReport, AbuseSink, LogSink};
use crate::timeout::StoreDeadline;
use http::Method;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_KEY_PREFIX: &str = "rl";

/// One window to count for a request.
#[derive(Debug, Clone, Copy)]
struct Check {
    scope: Scope,
    window: Window,
    limit: u32,
    /// Block the client for this long when the window is exceeded.
    block_for: Option<Duration>,
}

impl Check {
    fn new(scope: Scope, window: Window, limit: u32) -> Self {
        Self { scope, window, limit, block_for: None }
    }

    fn escalating(mut self, block_for: Duration) -> Self {
        self.block_for = Some(block_for);
        self
    }

    fn tier(&self) -> Tier {
        Tier::Limit { scope: self.scope, window: self.window }
    }
}

/// Evaluates requests against every configured tier.
///
/// Holds no mutable state of its own: counters and blocks live in the store, the config is
/// shared read-only.
pub struct RateLimitEngine<S, R = LogSink> {
    config: Arc<RateLimitConfig>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    limiter: WindowLimiter<S>,
    blocks: BlockList<S>,
    sink: R,
    deadline: StoreDeadline,
    prefix: String,
}

impl<S> RateLimitEngine<S, LogSink>
where
    S: CounterStore + 'static,
{
    /// Engine reporting abuse through [`LogSink`] and reading time from the system clock.
    pub fn new(config: impl Into<Arc<RateLimitConfig>>, store: S) -> Self {
        let config = config.into();
        let store = Arc::new(store);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let deadline = StoreDeadline::new(config.store_timeout);
        Self {
            limiter: WindowLimiter::new(store.clone(), clock.clone()),
            blocks: BlockList::new(store.clone(), clock.clone(), DEFAULT_KEY_PREFIX),
            config,
            store,
            clock,
            sink: LogSink,
            deadline,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl<S, R> RateLimitEngine<S, R>
where
    S: CounterStore + 'static,
{
    /// Send abuse reports to `sink` instead.
    pub fn with_sink<R2: AbuseSink>(self, sink: R2) -> RateLimitEngine<S, R2> {
        RateLimitEngine {
            config: self.config,
            store: self.store,
            clock: self.clock,
            limiter: self.limiter,
            blocks: self.blocks,
            sink,
            deadline: self.deadline,
            prefix: self.prefix,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self.rebuild();
        self
    }

    /// Namespace for every store key, so several services can share one store.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self.rebuild();
        self
    }

    /// Override the store deadline from the config.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = StoreDeadline::new(timeout);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn block_list(&self) -> &BlockList<S> {
        &self.blocks
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    fn rebuild(&mut self) {
        self.limiter = WindowLimiter::new(self.store.clone(), self.clock.clone());
        self.blocks = BlockList::new(self.store.clone(), self.clock.clone(), self.prefix.clone());
    }

    fn counter_key(&self, client: &ClientKey, endpoint: &EndpointKey, check: &Check) -> String {
        match check.scope {
            Scope::Endpoint => {
                format!("{}:{}:{}:{}", self.prefix, client, endpoint, check.window.as_str())
            }
            scope => {
                format!("{}:{}:{}:{}", self.prefix, client, scope.as_str(), check.window.as_str())
            }
        }
    }

    /// Windows to count for this request, in evaluation order.
    fn plan(&self, endpoint: &EndpointKey, method: &Method) -> Vec<Check> {
        let config = &self.config;
        let limits = config.endpoint_limit(endpoint);
        let mut checks = vec![
            Check::new(Scope::Endpoint, Window::Minute, limits.requests_per_minute),
            Check::new(Scope::Endpoint, Window::Hour, limits.requests_per_hour),
            Check::new(Scope::Endpoint, Window::Day, limits.requests_per_day),
        ];
        if limits.enable_burst_protection {
            checks.push(Check::new(Scope::Endpoint, Window::Burst, limits.burst_limit));
        }

        let global = &config.global;
        checks.push(Check::new(Scope::Global, Window::Minute, global.requests_per_minute));
        let hourly = Check::new(Scope::Global, Window::Hour, global.requests_per_hour);
        checks.push(if global.ip_blocking_enabled {
            hourly.escalating(global.block_duration)
        } else {
            hourly
        });

        if is_state_changing(method) {
            let security = &config.security;
            match endpoint.security_operation() {
                Some(SecurityOperation::Login) => {
                    checks.push(Check::new(
                        Scope::Login,
                        Window::Minute,
                        security.login_attempts_per_minute,
                    ));
                    checks.push(
                        Check::new(Scope::Login, Window::Hour, security.login_attempts_per_hour)
                            .escalating(security.login_block_duration),
                    );
                }
                Some(SecurityOperation::PasswordReset) => checks.push(Check::new(
                    Scope::PasswordReset,
                    Window::Hour,
                    security.password_reset_attempts_per_hour,
                )),
                Some(SecurityOperation::Registration) => checks.push(Check::new(
                    Scope::Registration,
                    Window::Hour,
                    security.registration_attempts_per_hour,
                )),
                None => {}
            }
        }
        checks
    }

    /// Evaluate every tier, propagating store errors.
    async fn evaluate_strict(
        &self,
        client: &ClientKey,
        endpoint: &EndpointKey,
        method: &Method,
    ) -> Result<(Decision, Option<AbuseReport>), StoreError> {
        if let Some(blocked_until) = self.blocks.is_blocked(client).await? {
            let now = self.clock.now_millis();
            tracing::debug!(client = %client, endpoint = %endpoint, "request from blocked client");
            let decision = Decision::Limited {
                tier: Tier::Blocked,
                quota: Quota { limit: 0, remaining: 0, reset_at_millis: blocked_until },
                retry_after: Some(retry_after(blocked_until, now)),
            };
            return Ok((decision, None));
        }

        let mut tightest: Option<Quota> = None;
        for check in self.plan(endpoint, method) {
            let key = self.counter_key(client, endpoint, &check);
            let status =
                self.limiter.check_and_increment(&key, check.limit, check.window.duration()).await?;
            if status.exceeded {
                return self.violation(client, endpoint, &check, status).await;
            }
            tightest = Some(tighter(tightest, quota_of(&status)));
        }
        Ok((Decision::Allowed { quota: tightest }, None))
    }

    async fn violation(
        &self,
        client: &ClientKey,
        endpoint: &EndpointKey,
        check: &Check,
        status: WindowStatus,
    ) -> Result<(Decision, Option<AbuseReport>), StoreError> {
        let tier = check.tier();
        let mut quota = Quota { remaining: 0, ..quota_of(&status) };
        let mut detail = format!(
            "{} requests against a limit of {} per {}",
            status.count,
            status.limit,
            check.window.as_str()
        );
        if let Some(duration) = check.block_for {
            quota.reset_at_millis = self.blocks.block(client, duration).await?;
            detail.push_str(&format!("; blocked for {}s", duration.as_secs()));
        }

        let now = self.clock.now_millis();
        tracing::info!(
            client = %client,
            endpoint = %endpoint,
            tier = %tier,
            count = status.count,
            limit = status.limit,
            "rate limit exceeded"
        );
        let report = AbuseReport {
            client_key: client.to_string(),
            endpoint_key: endpoint.to_string(),
            reason: tier.to_string(),
            detail,
            at_millis: now,
        };
        let decision = Decision::Limited {
            tier,
            quota,
            retry_after: Some(retry_after(quota.reset_at_millis, now)),
        };
        Ok((decision, Some(report)))
    }
}

impl<S, R> RateLimitEngine<S, R>
where
    S: CounterStore + 'static,
    R: AbuseSink + Sync,
    R::Future: Send + 'static,
{
    /// Decide whether the request may proceed.
    ///
    /// Never fails: a store error or an expired store deadline allows the request (fail
    /// open) with no quota information.
    pub async fn evaluate(
        &self,
        client: &ClientKey,
        endpoint: &EndpointKey,
        method: &Method,
    ) -> Decision {
        let outcome =
            self.deadline.execute(self.evaluate_strict(client, endpoint, method)).await;
        match outcome {
            Ok((decision, report)) => {
                if let Some(report) = report {
                    emit_best_effort(self.sink.clone(), report).await;
                }
                decision
            }
            Err(e) => {
                tracing::warn!(
                    client = %client,
                    endpoint = %endpoint,
                    error = %e,
                    "rate limit store failure; failing open"
                );
                Decision::Allowed { quota: None }
            }
        }
    }
}

fn is_state_changing(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn quota_of(status: &WindowStatus) -> Quota {
    Quota {
        limit: status.limit,
        remaining: status.remaining(),
        reset_at_millis: status.reset_at_millis,
    }
}

fn tighter(current: Option<Quota>, candidate: Quota) -> Quota {
    match current {
        Some(current)
            if (current.remaining, current.limit) <= (candidate.remaining, candidate.limit) =>
        {
            current
        }
        _ => candidate,
    }
}

fn retry_after(reset_at_millis: u64, now_millis: u64) -> Duration {
    Duration::from_millis(reset_at_millis.saturating_sub(now_millis))
}
