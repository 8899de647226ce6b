mod common;

use axum::{routing::get, Router};
use common::test_helpers::{memory_engine, ok_backend, FailingStore, TestResponse};
use http::{Request, StatusCode};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tollgate::config::{EndpointRateLimit, GlobalRateLimit};
use tollgate::telemetry::MemorySink;
use tollgate::{
    AuthenticatedUser, InMemoryCounterStore, ManualClock, RateLimitConfig, RateLimitEngine,
    RateLimitLayer,
};
use tower::{service_fn, ServiceBuilder, ServiceExt};

const START_MILLIS: u64 = 1_700_000_000_000;

fn config(per_minute: u32) -> RateLimitConfig {
    RateLimitConfig::default()
        .with_endpoint("GET:/api/alarms", EndpointRateLimit::new(per_minute, 1_000, 10_000))
        .with_global(GlobalRateLimit {
            requests_per_minute: 10_000,
            requests_per_hour: 10_000,
            ..Default::default()
        })
}

fn layer(
    per_minute: u32,
    clock: &ManualClock,
) -> RateLimitLayer<Arc<InMemoryCounterStore>, MemorySink> {
    let (engine, _, _) = memory_engine(config(per_minute), clock);
    RateLimitLayer::new(engine)
}

fn get_from(ip: &str, path: &str) -> Request<String> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", ip)
        .body(String::new())
        .unwrap()
}

#[tokio::test]
async fn allowed_requests_carry_quota_headers() {
    let clock = ManualClock::new(START_MILLIS);
    let svc = ServiceBuilder::new().layer(layer(3, &clock)).service(service_fn(ok_backend));

    let response = svc.clone().oneshot(get_from("198.51.100.1", "/api/alarms")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), "ok");
    assert_eq!(response.headers()["x-ratelimit-limit"], "3");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "2");
    assert_eq!(response.headers()["x-ratelimit-reset"], "1700000060");

    let response = svc.oneshot(get_from("198.51.100.1", "/api/alarms?page=2")).await.unwrap();
    assert_eq!(response.headers()["x-ratelimit-remaining"], "1");
}

#[tokio::test]
async fn limited_requests_short_circuit_with_429() {
    let clock = ManualClock::new(START_MILLIS);
    let calls = Arc::new(AtomicUsize::new(0));
    let backend = {
        let calls = calls.clone();
        service_fn(move |_req: Request<String>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<TestResponse, Infallible>(http::Response::new("ok".to_string()))
            }
        })
    };
    let svc = ServiceBuilder::new().layer(layer(1, &clock)).service(backend);

    svc.clone().oneshot(get_from("198.51.100.2", "/api/alarms")).await.unwrap();
    let mut request = get_from("198.51.100.2", "/api/alarms");
    request.headers_mut().insert("x-request-id", "req-123".parse().unwrap());
    let response = svc.oneshot(request).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1, "the backend never sees a limited request");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = response.headers();
    assert_eq!(headers["x-ratelimit-limit"], "1");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    assert_eq!(headers["x-ratelimit-reset"], "1700000060");
    assert_eq!(headers["retry-after"], "60");
    assert_eq!(headers["content-type"], "application/json");

    let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
    assert_eq!(body["statusCode"], 429);
    assert_eq!(body["title"], "Rate Limit Exceeded");
    assert_eq!(body["detail"], "Too many requests. Please try again later.");
    assert_eq!(body["traceId"], "req-123");
    assert_eq!(body["timestamp"], "2023-11-14T22:13:20.000Z");
    assert_eq!(body["rateLimit"]["reset"], 1_700_000_060u64);
    assert_eq!(body["rateLimit"]["retryAfter"], "60");
}

#[tokio::test]
async fn skipped_paths_are_never_counted() {
    let clock = ManualClock::new(START_MILLIS);
    let svc = ServiceBuilder::new().layer(layer(1, &clock)).service(service_fn(ok_backend));

    for path in ["/health", "/metrics", "/assets/app.js", "/logo.PNG", "/ws/alarms"] {
        for _ in 0..3 {
            let response = svc.clone().oneshot(get_from("198.51.100.3", path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
            assert!(response.headers().get("x-ratelimit-limit").is_none(), "{path}");
        }
    }
}

#[tokio::test]
async fn authenticated_users_are_counted_separately_from_their_ip() {
    let clock = ManualClock::new(START_MILLIS);
    let svc = ServiceBuilder::new().layer(layer(1, &clock)).service(service_fn(ok_backend));

    let as_user = |id: &str| {
        let mut request = get_from("198.51.100.4", "/api/alarms");
        request.extensions_mut().insert(AuthenticatedUser(id.to_string()));
        request
    };

    assert_eq!(svc.clone().oneshot(as_user("alice")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(svc.clone().oneshot(as_user("bob")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(
        svc.clone().oneshot(get_from("198.51.100.4", "/api/alarms")).await.unwrap().status(),
        StatusCode::OK
    );
    assert_eq!(
        svc.oneshot(as_user("alice")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn store_outage_passes_requests_without_headers() {
    let engine = RateLimitEngine::new(config(1), FailingStore::default());
    let svc = ServiceBuilder::new()
        .layer(RateLimitLayer::new(engine))
        .service(service_fn(ok_backend));

    for _ in 0..5 {
        let response = svc.clone().oneshot(get_from("198.51.100.5", "/api/alarms")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn works_as_an_axum_layer() {
    let clock = ManualClock::new(START_MILLIS);
    let (engine, _, sink) = memory_engine(config(2), &clock);
    let app = Router::new()
        .route("/api/alarms", get(|| async { "alarms" }))
        .layer(RateLimitLayer::new(engine));

    let request = || {
        Request::builder()
            .uri("/api/alarms")
            .header("x-real-ip", "203.0.113.50")
            .body(axum::body::Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["type"], "RateLimitError");
    assert_eq!(body["rateLimit"]["limit"], 2);

    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].client_key, "ip:203.0.113.50");
}
