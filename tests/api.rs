use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderValue, Method, Request, StatusCode, header},
    response::Response,
};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tower::ServiceExt;
use vitae::application::cv::{CvDataService, KvCvStore};
use vitae::application::kv::BindingSlot;
use vitae::application::resolver::{
    DataResolver, DataSource, ExecutionContext, ResolverOptions, SourceError,
};
use vitae::cache::{CacheConfig, CacheService, RetryPolicy};
use vitae::config::{self, CliArgs, ResponseCacheSettings};
use vitae::domain::CvDocument;
use vitae::infra::cache::{ResponseCache, X_CACHE};
use vitae::infra::http::{AdminAuth, ApiState, build_router};
use vitae::infra::kv::MemoryKv;
use vitae_api_types::{Envelope, ImportOutcome, SaveOutcome};

const TOKEN: &str = "s3cret-admin";

fn sample() -> Value {
    json!({
        "personalInfo": {"name": "Ada Lovelace", "title": "Analyst"},
        "summary": "First programmer.",
        "experience": [{"company": "Analytical Engine", "role": "Author"}],
        "skills": ["mathematics", "notes"]
    })
}

struct TestApp {
    router: Router,
    kv: Arc<MemoryKv>,
}

fn app_with(binding: Option<Arc<MemoryKv>>, token: Option<&str>, max_body_bytes: usize) -> TestApp {
    let kv = binding.clone().unwrap_or_default();
    let slot = match binding {
        Some(kv) => BindingSlot::bound(kv),
        None => BindingSlot::Missing,
    };
    let options = ResolverOptions {
        key: "cv-data".to_string(),
        namespace_id: None,
        cli_path: "unused".into(),
        cli_timeout: Duration::from_secs(1),
        fallback_file: "/nonexistent/cv-data.json".into(),
    };
    let resolver = DataResolver::for_context(ExecutionContext::Runtime, slot.clone(), options);
    let store = KvCvStore::new(slot, "cv-data", Arc::new(resolver));

    let cache = CacheService::new(CacheConfig {
        retry: RetryPolicy::none(),
        ..CacheConfig::default()
    });
    let responses = ResponseCache::from_settings(&ResponseCacheSettings {
        enabled: true,
        prefix: "vitae".to_string(),
        ttl: Duration::from_secs(300),
        stale_window: Duration::from_secs(60),
        limit: NonZeroUsize::new(64).unwrap(),
    });

    let state = ApiState {
        cv: CvDataService::new(cache, Arc::new(store)),
        responses,
        auth: AdminAuth::new(token),
        max_body_bytes,
    };
    TestApp {
        router: build_router(state),
        kv,
    }
}

fn seeded_app() -> TestApp {
    let kv = Arc::new(MemoryKv::new());
    kv.insert("cv-data", sample());
    app_with(Some(kv), Some(TOKEN), 64 * 1024)
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

fn post(uri: &str, token: Option<&str>, content_type: &str, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, content_type);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(body.into()).expect("request should build")
}

async fn json_body<T: DeserializeOwned>(response: Response) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should buffer");
    serde_json::from_slice(&bytes).expect("body should be JSON")
}

fn x_cache(response: &Response) -> Option<&HeaderValue> {
    response.headers().get(X_CACHE)
}

async fn error_code(response: Response) -> String {
    let envelope: Envelope<Value> = json_body(response).await;
    assert!(!envelope.success);
    envelope.error.expect("error body").code
}

#[tokio::test]
async fn get_cv_returns_the_stored_document() {
    let app = seeded_app();

    let response = send(&app.router, get("/api/v1/cv")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(x_cache(&response).unwrap(), "MISS");

    let envelope: Envelope<Value> = json_body(response).await;
    assert!(envelope.success);
    assert_eq!(envelope.data, Some(sample()));

    let cached = send(&app.router, get("/api/v1/cv")).await;
    assert_eq!(x_cache(&cached).unwrap(), "HIT");
}

#[tokio::test]
async fn sections_are_served_individually() {
    let app = seeded_app();

    let response = send(&app.router, get("/api/v1/cv/sections/skills")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let envelope: Envelope<Value> = json_body(response).await;
    assert_eq!(envelope.data, Some(json!(["mathematics", "notes"])));

    let unknown = send(&app.router, get("/api/v1/cv/sections/hobbies")).await;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(unknown).await, "bad_request");

    let absent = send(&app.router, get("/api/v1/cv/sections/education")).await;
    assert_eq!(absent.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(absent).await, "not_found");
}

#[tokio::test]
async fn export_sets_format_headers_and_etag() {
    let app = seeded_app();
    let version = CvDocument::from_value(sample()).unwrap().version();

    let response = send(&app.router, get("/api/v1/cv/export?format=yaml")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/yaml");
    assert_eq!(
        headers.get(header::ETAG).unwrap().to_str().unwrap(),
        format!("\"{version}\"")
    );
    assert_eq!(
        headers.get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment; filename=\"cv.yaml\""
    );
    let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_yaml::from_slice(&text).unwrap();
    assert_eq!(parsed, sample());

    let default = send(&app.router, get("/api/v1/cv/export")).await;
    assert_eq!(
        default.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let parsed: Value = json_body(default).await;
    assert_eq!(parsed, sample());

    let rejected = send(&app.router, get("/api/v1/cv/export?format=xml")).await;
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(rejected).await, "unsupported_format");
}

#[tokio::test]
async fn writes_require_a_matching_admin_token() {
    let app = seeded_app();
    let body = serde_json::to_vec(&sample()).unwrap();

    let missing = send(&app.router, post("/api/v1/cv", None, "application/json", body.clone())).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(missing).await, "unauthorized");

    let wrong = send(
        &app.router,
        post("/api/v1/cv", Some("guess"), "application/json", body.clone()),
    )
    .await;
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

    let disabled = app_with(Some(Arc::new(MemoryKv::new())), None, 64 * 1024);
    let response = send(
        &disabled.router,
        post("/api/v1/cv", Some(TOKEN), "application/json", body),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "forbidden");
}

#[tokio::test]
async fn save_stores_document_and_invalidates_cached_reads() {
    let app = seeded_app();
    send(&app.router, get("/api/v1/cv")).await;
    send(&app.router, get("/api/v1/cv/sections/summary")).await;
    let hit = send(&app.router, get("/api/v1/cv/sections/summary")).await;
    assert_eq!(x_cache(&hit).unwrap(), "HIT");

    let mut updated = sample();
    updated["summary"] = json!("Wrote the first algorithm.");
    let response = send(
        &app.router,
        post(
            "/api/v1/cv",
            Some(TOKEN),
            "application/json",
            serde_json::to_vec(&updated).unwrap(),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let saved: Envelope<SaveOutcome> = json_body(response).await;
    let expected_version = CvDocument::from_value(updated.clone()).unwrap().version();
    assert_eq!(saved.data.unwrap().version, expected_version);
    assert_eq!(app.kv.get("cv-data"), Some(updated.clone()));

    let after = send(&app.router, get("/api/v1/cv/sections/summary")).await;
    assert_eq!(x_cache(&after).unwrap(), "MISS");
    let envelope: Envelope<Value> = json_body(after).await;
    assert_eq!(envelope.data, Some(json!("Wrote the first algorithm.")));
}

#[tokio::test]
async fn invalid_documents_and_bad_json_are_rejected() {
    let app = seeded_app();

    let invalid = send(
        &app.router,
        post("/api/v1/cv", Some(TOKEN), "application/json", r#"{"summary": "no name"}"#),
    )
    .await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(invalid).await, "invalid_document");

    let malformed = send(
        &app.router,
        post("/api/v1/cv", Some(TOKEN), "application/json", "{not json"),
    )
    .await;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(malformed).await, "bad_request");

    assert_eq!(app.kv.get("cv-data"), Some(sample()));
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let kv = Arc::new(MemoryKv::new());
    kv.insert("cv-data", sample());
    let app = app_with(Some(kv), Some(TOKEN), 128);

    let mut large = sample();
    large["summary"] = json!("x".repeat(1_024));
    let response = send(
        &app.router,
        post(
            "/api/v1/cv",
            Some(TOKEN),
            "application/json",
            serde_json::to_vec(&large).unwrap(),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_code(response).await, "payload_too_large");
}

#[tokio::test]
async fn import_preview_validates_without_saving() {
    let app = seeded_app();
    send(&app.router, get("/api/v1/cv")).await;

    let yaml = "personalInfo:\n  name: Grace Hopper\nskills:\n  - COBOL\n";
    let response = send(
        &app.router,
        post("/api/v1/cv/import?preview=true", Some(TOKEN), "application/yaml", yaml),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let outcome: Envelope<ImportOutcome> = json_body(response).await;
    let outcome = outcome.data.unwrap();
    assert!(outcome.preview);
    assert!(!outcome.saved);
    assert_eq!(outcome.document["personalInfo"]["name"], "Grace Hopper");

    assert_eq!(app.kv.get("cv-data"), Some(sample()));
    let cached = send(&app.router, get("/api/v1/cv")).await;
    assert_eq!(x_cache(&cached).unwrap(), "HIT");
}

#[tokio::test]
async fn import_saves_detected_format() {
    let app = seeded_app();

    let yaml = "personalInfo:\n  name: Grace Hopper\n";
    let response = send(
        &app.router,
        post("/api/v1/cv/import", Some(TOKEN), "text/plain", yaml),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let outcome: Envelope<ImportOutcome> = json_body(response).await;
    assert!(outcome.data.unwrap().saved);
    assert_eq!(
        app.kv.get("cv-data"),
        Some(json!({"personalInfo": {"name": "Grace Hopper"}}))
    );

    let garbage = send(
        &app.router,
        post("/api/v1/cv/import", Some(TOKEN), "text/plain", "\t- : ]["),
    )
    .await;
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn writes_without_kv_binding_fail_upstream() {
    let app = app_with(None, Some(TOKEN), 64 * 1024);

    let response = send(
        &app.router,
        post(
            "/api/v1/cv",
            Some(TOKEN),
            "application/json",
            serde_json::to_vec(&sample()).unwrap(),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(response).await, "upstream_error");

    let read = send(&app.router, get("/api/v1/cv")).await;
    assert_eq!(read.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let app = seeded_app();

    let health = send(&app.router, get("/health")).await;
    assert_eq!(health.status(), StatusCode::NO_CONTENT);

    let missing = send(&app.router, get("/api/v1/nope")).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(missing).await, "not_found");
}

struct Unreachable {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl DataSource for Unreachable {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn fetch(&self) -> Result<Value, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SourceError::failed("connection refused"))
    }
}

#[tokio::test]
async fn served_state_reports_exhausted_sources_without_retrying() {
    let settings = config::load(&CliArgs::parse_from(["vitae", "serve"])).expect("default settings");
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = DataResolver::new(
        ExecutionContext::Runtime,
        vec![Box::new(Unreachable {
            calls: calls.clone(),
        })],
    );
    let store = KvCvStore::new(BindingSlot::Missing, "cv-data", Arc::new(resolver));
    let router = build_router(ApiState::from_settings(&settings, Arc::new(store)).await);

    let started = Instant::now();
    let response = send(&router, get("/api/v1/cv")).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(response).await, "upstream_error");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_millis(900));
}
