//! The CV HTTP API.
//!
//! ```text
//! GET  /api/v1/cv
//! POST /api/v1/cv                          (admin)
//! GET  /api/v1/cv/export?format=json|yaml
//! POST /api/v1/cv/import[?preview=true]    (admin)
//! GET  /api/v1/cv/sections/{name}
//! GET  /health
//! ```

pub mod cache;
pub mod error;
mod handlers;
pub mod middleware;
mod state;

pub use error::ApiError;
pub use middleware::AdminAuth;
pub use state::ApiState;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::infra::cache::{CV_PATH, EXPORT_PATH, IMPORT_PATH};

pub fn build_router(state: ApiState) -> Router {
    let responses = state.responses.clone();
    let auth = state.auth.clone();
    let body_limit = state.max_body_bytes;

    Router::new()
        .route("/health", get(handlers::health))
        .route(CV_PATH, get(handlers::get_cv).post(handlers::save_cv))
        .route(EXPORT_PATH, get(handlers::export_cv))
        .route(IMPORT_PATH, post(handlers::import_cv))
        .route("/api/v1/cv/sections/{name}", get(handlers::get_section))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum_middleware::from_fn_with_state(
            responses.clone(),
            cache::invalidate_on_write,
        ))
        .layer(axum_middleware::from_fn_with_state(
            responses,
            cache::serve_cached,
        ))
        .layer(axum_middleware::from_fn_with_state(
            auth,
            middleware::require_admin,
        ))
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
