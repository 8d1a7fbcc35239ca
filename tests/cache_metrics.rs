use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use metrics_util::debugging::DebuggingRecorder;
use tower::ServiceExt;
use vitae::cache::{CacheConfig, CacheOptions, CacheService, ManualClock, RetryPolicy};
use vitae::config::ResponseCacheSettings;
use vitae::infra::cache::ResponseCache;
use vitae::infra::http::cache::{invalidate_on_write, serve_cached};

fn windows() -> CacheOptions {
    CacheOptions::default()
        .with_ttl(Duration::from_millis(100))
        .with_stale_ttl(Duration::from_millis(1_000))
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Value cache: hit, stale hit, miss, evict.
    let clock = Arc::new(ManualClock::new(1_000_000));
    let cache = CacheService::with_clock(
        CacheConfig {
            max_size_bytes: 20,
            retry: RetryPolicy::none(),
            ..CacheConfig::default()
        },
        clock.clone(),
    );
    cache.set("k", &1_u32, &windows()).await.unwrap();
    let fresh: u32 = cache
        .get("k", || async { Ok::<_, std::io::Error>(2) }, windows())
        .await
        .unwrap();
    assert_eq!(fresh, 1);

    clock.advance(Duration::from_millis(150));
    let stale: u32 = cache
        .get("k", || async { Ok::<_, std::io::Error>(2) }, windows())
        .await
        .unwrap();
    assert_eq!(stale, 1);

    let missed: u32 = cache
        .get("other", || async { Ok::<_, std::io::Error>(3) }, windows())
        .await
        .unwrap();
    assert_eq!(missed, 3);
    cache
        .set("large", &"x".repeat(8), &windows())
        .await
        .unwrap();

    // Response cache: miss, hit, invalidate.
    let responses = ResponseCache::from_settings(&ResponseCacheSettings {
        enabled: true,
        prefix: "vitae".to_string(),
        ttl: Duration::from_secs(300),
        stale_window: Duration::from_secs(60),
        limit: NonZeroUsize::new(8).unwrap(),
    });
    let app = Router::new()
        .route(
            "/api/v1/cv",
            get(|| async { "{}" }).post(|| async { StatusCode::OK }),
        )
        .layer(middleware::from_fn_with_state(
            responses.clone(),
            invalidate_on_write,
        ))
        .layer(middleware::from_fn_with_state(responses, serve_cached));

    for method in [Method::GET, Method::GET, Method::POST] {
        let request = Request::builder()
            .method(method)
            .uri("/api/v1/cv")
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "vitae_cache_hit_total",
        "vitae_cache_stale_hit_total",
        "vitae_cache_miss_total",
        "vitae_cache_evict_total",
        "vitae_response_cache_hit_total",
        "vitae_response_cache_miss_total",
        "vitae_response_cache_invalidate_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
    cache.destroy().await;
}
