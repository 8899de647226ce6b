use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::Ready;
use http::{Method, Request, Response};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use tollgate::classify::normalize_endpoint;
use tollgate::config::{EndpointRateLimit, GlobalRateLimit};
use tollgate::telemetry::NullSink;
use tollgate::{ClientKey, InMemoryCounterStore, RateLimitConfig, RateLimitEngine, RateLimitLayer};
use tower::{Service, ServiceBuilder};

// Answers every request with an empty 200.
#[derive(Clone)]
struct OkService;

impl Service<Request<String>> for OkService {
    type Response = Response<String>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<String>) -> Self::Future {
        futures::future::ready(Ok(Response::new(String::new())))
    }
}

fn roomy_config() -> RateLimitConfig {
    RateLimitConfig::default()
        .with_endpoint("GET:/api/alarms/{id}", EndpointRateLimit::new(u32::MAX, u32::MAX, u32::MAX))
        .with_global(GlobalRateLimit {
            requests_per_minute: u32::MAX,
            requests_per_hour: u32::MAX,
            ..Default::default()
        })
}

fn engine_allowed_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = RateLimitEngine::new(roomy_config(), InMemoryCounterStore::new())
        .with_sink(NullSink);
    let client = ClientKey::ip("198.51.100.1");
    let endpoint = normalize_endpoint("GET", "/api/alarms/42");

    c.bench_function("engine_evaluate_allowed", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(engine.evaluate(&client, &endpoint, &Method::GET).await);
        });
    });
}

fn engine_many_clients(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = RateLimitEngine::new(roomy_config(), InMemoryCounterStore::new())
        .with_sink(NullSink);
    let endpoint = normalize_endpoint("GET", "/api/alarms/42");
    let next = AtomicU64::new(0);

    c.bench_function("engine_evaluate_10k_clients", |b| {
        b.to_async(&rt).iter(|| async {
            let n = next.fetch_add(1, Ordering::Relaxed) % 10_000;
            let client = ClientKey::user(&n.to_string());
            black_box(engine.evaluate(&client, &endpoint, &Method::GET).await);
        });
    });
}

fn middleware_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = RateLimitEngine::new(roomy_config(), InMemoryCounterStore::new())
        .with_sink(NullSink);
    let svc = ServiceBuilder::new().layer(RateLimitLayer::new(engine)).service(OkService);

    c.bench_function("middleware_allowed_request", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let req = Request::builder()
                .uri("/api/alarms/42")
                .header("x-forwarded-for", "198.51.100.1")
                .body(String::new())
                .unwrap();
            let _ = black_box(local_svc.call(black_box(req)).await);
        });
    });
}

criterion_group!(benches, engine_allowed_path, engine_many_clients, middleware_throughput);
criterion_main!(benches);
