use axum::{
    body::Body,
    extract::State,
    http::{Method, Request},
    middleware::Next,
    response::Response,
};
use tracing::info;
use url::form_urlencoded;

use crate::infra::cache::{CV_PATH, IMPORT_PATH, RequestTarget, ResponseCache};

/// Serve cacheable reads from the response cache and store fresh responses.
pub async fn serve_cached(
    State(cache): State<ResponseCache>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let target = RequestTarget::of(&request);
    if !target.is_cacheable() {
        return next.run(request).await;
    }

    if let Some(hit) = cache.get(&target) {
        return hit;
    }

    let response = next.run(request).await;
    cache.put(&target, response).await
}

/// Drop cached reads after a successful document write.
pub async fn invalidate_on_write(
    State(cache): State<ResponseCache>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let target = RequestTarget::of(&request);
    let response = next.run(request).await;

    if response.status().is_success() && is_document_write(&target) {
        let removed = cache.invalidate();
        info!(
            target = "vitae::http::cache",
            path = %target.path,
            removed,
            "Invalidated cached CV responses after write"
        );
    }

    response
}

fn is_document_write(target: &RequestTarget) -> bool {
    if target.method != Method::POST {
        return false;
    }
    match target.path.as_str() {
        CV_PATH => true,
        IMPORT_PATH => !is_preview(target.query.as_deref()),
        _ => false,
    }
}

fn is_preview(query: Option<&str>) -> bool {
    query.is_some_and(|query| {
        form_urlencoded::parse(query.as_bytes())
            .any(|(name, value)| name == "preview" && value.eq_ignore_ascii_case("true"))
    })
}
