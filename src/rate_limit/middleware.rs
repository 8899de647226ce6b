use crate::classify::{derive_client_key, normalize_endpoint, should_skip};
use crate::rate_limit::engine::RateLimitEngine;
use crate::rate_limit::store::CounterStore;
use crate::rate_limit::{Decision, Quota};
use crate::telemetry::AbuseSink;
use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

const REQUEST_ID_HEADERS: [&str; 2] = ["x-request-id", "x-correlation-id"];

/// A layer that enforces rate limits using a shared [`RateLimitEngine`].
pub struct RateLimitLayer<S, R> {
    engine: Arc<RateLimitEngine<S, R>>,
}

impl<S, R> RateLimitLayer<S, R> {
    pub fn new(engine: RateLimitEngine<S, R>) -> Self {
        Self { engine: Arc::new(engine) }
    }

    /// Share one engine between several layers (e.g. separate routers).
    pub fn from_shared(engine: Arc<RateLimitEngine<S, R>>) -> Self {
        Self { engine }
    }
}

impl<S, R> Clone for RateLimitLayer<S, R> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone() }
    }
}

impl<Inner, S, R> Layer<Inner> for RateLimitLayer<S, R> {
    type Service = RateLimitService<Inner, S, R>;

    fn layer(&self, service: Inner) -> Self::Service {
        RateLimitService { inner: service, engine: self.engine.clone() }
    }
}

/// Middleware service that enforces rate limits on HTTP requests.
///
/// Limited requests never reach the inner service and get a `429` with a JSON body.
/// Allowed requests get `X-RateLimit-*` headers for the tightest window, when known.
pub struct RateLimitService<Inner, S, R> {
    inner: Inner,
    engine: Arc<RateLimitEngine<S, R>>,
}

impl<Inner: Clone, S, R> Clone for RateLimitService<Inner, S, R> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), engine: self.engine.clone() }
    }
}

impl<Inner, S, R, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<Inner, S, R>
where
    Inner: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: CounterStore + 'static,
    R: AbuseSink + Sync,
    R::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let engine = self.engine.clone();

        Box::pin(async move {
            if should_skip(req.uri().path()) {
                return inner.call(req).await;
            }

            let client = derive_client_key(&req);
            let endpoint = normalize_endpoint(req.method().as_str(), req.uri().path());
            let method = req.method().clone();
            let trace_id = trace_id(req.headers());

            match engine.evaluate(&client, &endpoint, &method).await {
                Decision::Limited { quota, retry_after, .. } => {
                    Ok(too_many_requests(&quota, retry_after, &trace_id, engine.now_millis()))
                }
                Decision::Allowed { quota } => {
                    let mut response = inner.call(req).await?;
                    if let Some(quota) = quota {
                        insert_quota_headers(response.headers_mut(), &quota);
                    }
                    Ok(response)
                }
            }
        })
    }
}

fn insert_quota_headers(headers: &mut HeaderMap, quota: &Quota) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(quota.reset_epoch_secs()));
}

/// Whole seconds, rounded up, never below one.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
    millis.div_ceil(1000).max(1)
}

fn trace_id(headers: &HeaderMap) -> String {
    REQUEST_ID_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn too_many_requests<B>(
    quota: &Quota,
    retry_after: Option<Duration>,
    trace_id: &str,
    now_millis: u64,
) -> Response<B>
where
    B: From<String>,
{
    let retry_after = retry_after.map(retry_after_secs);
    let timestamp = i64::try_from(now_millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    let body = serde_json::json!({
        "statusCode": 429,
        "title": "Rate Limit Exceeded",
        "detail": "Too many requests. Please try again later.",
        "type": "RateLimitError",
        "traceId": trace_id,
        "timestamp": timestamp,
        "rateLimit": {
            "limit": quota.limit,
            "remaining": 0,
            "reset": quota.reset_epoch_secs(),
            "retryAfter": retry_after.map(|secs| secs.to_string()),
        },
    });

    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    insert_quota_headers(headers, &Quota { remaining: 0, ..*quota });
    if let Some(secs) = retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}
