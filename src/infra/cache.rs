//! API response cache.
//!
//! Keys are `"<prefix>.cache" + path [+ "?" + query]`; only `GET` requests to
//! the CV read routes are cached. Writes invalidate every CV read key.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use vitae_api_types::ExportFormat;

use crate::cache::lock::MutexExt;
use crate::config::ResponseCacheSettings;
use crate::domain::document::section_names;

pub const CV_PATH: &str = "/api/v1/cv";
pub const EXPORT_PATH: &str = "/api/v1/cv/export";
pub const IMPORT_PATH: &str = "/api/v1/cv/import";
pub const SECTIONS_PREFIX: &str = "/api/v1/cv/sections/";

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

const METRIC_HIT: &str = "vitae_response_cache_hit_total";
const METRIC_MISS: &str = "vitae_response_cache_miss_total";
const METRIC_INVALIDATE: &str = "vitae_response_cache_invalidate_total";

/// Method and URI of a request, captured before the request is consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
}

impl RequestTarget {
    pub fn of<B>(request: &Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
        }
    }

    pub fn get(path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (path_and_query, None),
        };
        Self {
            method: Method::GET,
            path: path.to_string(),
            query,
        }
    }

    pub fn is_cacheable(&self) -> bool {
        is_cacheable(&self.method, &self.path)
    }

    pub fn key(&self, prefix: &str) -> String {
        cache_key(prefix, &self.path, self.query.as_deref())
    }
}

/// Only `GET` to the document, export, and section routes.
pub fn is_cacheable(method: &Method, path: &str) -> bool {
    if method != Method::GET {
        return false;
    }
    match path {
        CV_PATH | EXPORT_PATH => true,
        _ => path
            .strip_prefix(SECTIONS_PREFIX)
            .is_some_and(|name| !name.is_empty() && !name.contains('/')),
    }
}

/// Pure function of (prefix, path, query); an empty query is the same as none.
pub fn cache_key(prefix: &str, path: &str, query: Option<&str>) -> String {
    match query.filter(|query| !query.is_empty()) {
        Some(query) => format!("{prefix}.cache{path}?{query}"),
        None => format!("{prefix}.cache{path}"),
    }
}

/// Every key a write must drop: the document, each export variant, each section.
pub fn invalidation_keys(prefix: &str) -> Vec<String> {
    let mut keys = vec![cache_key(prefix, CV_PATH, None)];
    for format in ExportFormat::ALL {
        let query = format!("format={}", format.as_str());
        keys.push(cache_key(prefix, EXPORT_PATH, Some(&query)));
    }
    keys.push(cache_key(prefix, EXPORT_PATH, None));
    for name in section_names() {
        keys.push(cache_key(prefix, &format!("{SECTIONS_PREFIX}{name}"), None));
    }
    keys
}

#[derive(Clone)]
pub struct CachedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
    stored_at: Instant,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let mut stored_headers = Vec::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            stored_headers.push((name.clone(), value.clone()));
        }

        Self {
            status,
            headers: stored_headers,
            body,
            stored_at: Instant::now(),
        }
    }

    fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        headers.clear();
        for (name, value) in self.headers {
            headers.append(name, value);
        }

        response
    }
}

#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("failed to buffer response body: {0}")]
    Buffer(String),
}

pub async fn buffer_response(
    response: Response,
) -> Result<(Response, CachedResponse), (Response, CacheStoreError)> {
    let (parts, body) = response.into_parts();
    match BodyExt::collect(body).await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let cached = CachedResponse::new(parts.status, &parts.headers, bytes.clone());
            let rebuilt = Response::from_parts(parts, Body::from(bytes));
            Ok((rebuilt, cached))
        }
        Err(error) => {
            let rebuilt = Response::from_parts(parts, Body::empty());
            Err((rebuilt, CacheStoreError::Buffer(error.to_string())))
        }
    }
}

/// In-process response store bounded by entry count.
pub struct ApiResponseCache {
    prefix: String,
    ttl: Duration,
    cache_control: HeaderValue,
    entries: Mutex<LruCache<String, CachedResponse>>,
}

impl ApiResponseCache {
    pub fn new(settings: &ResponseCacheSettings) -> Self {
        let directive = format!(
            "public, max-age={}, stale-while-revalidate={}",
            settings.ttl.as_secs(),
            settings.stale_window.as_secs()
        );
        Self {
            prefix: settings.prefix.clone(),
            ttl: settings.ttl,
            cache_control: HeaderValue::from_str(&directive)
                .unwrap_or_else(|_| HeaderValue::from_static("no-store")),
            entries: Mutex::new(LruCache::new(settings.limit)),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.entries.lock_or_recover("response_len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, target: &RequestTarget) -> Option<Response> {
        if !target.is_cacheable() {
            return None;
        }

        let key = target.key(&self.prefix);
        let cached = {
            let mut entries = self.entries.lock_or_recover("response_get");
            match entries.get(&key) {
                Some(cached) if cached.stored_at.elapsed() < self.ttl => Some(cached.clone()),
                Some(_) => {
                    entries.pop(&key);
                    None
                }
                None => None,
            }
        };

        match cached {
            Some(cached) => {
                counter!(METRIC_HIT).increment(1);
                debug!(
                    target = "vitae::http::cache",
                    key = %key,
                    outcome = "hit",
                    "serving cached response"
                );
                let mut response = cached.into_response();
                response
                    .headers_mut()
                    .insert(X_CACHE, HeaderValue::from_static("HIT"));
                Some(response)
            }
            None => {
                counter!(METRIC_MISS).increment(1);
                debug!(
                    target = "vitae::http::cache",
                    key = %key,
                    outcome = "miss",
                    "response cache miss"
                );
                None
            }
        }
    }

    /// Stamp caching headers and keep a copy of successful cacheable responses.
    pub async fn put(&self, target: &RequestTarget, mut response: Response) -> Response {
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, self.cache_control.clone());
        headers.insert(X_CACHE, HeaderValue::from_static("MISS"));

        if !target.is_cacheable() || !response.status().is_success() {
            return response;
        }

        let key = target.key(&self.prefix);
        match buffer_response(response).await {
            Ok((rebuilt, cached)) => {
                let evicted = self
                    .entries
                    .lock_or_recover("response_put")
                    .push(key.clone(), cached)
                    .filter(|(evicted_key, _)| *evicted_key != key);
                if let Some((evicted_key, _)) = evicted {
                    debug!(
                        target = "vitae::http::cache",
                        key = %evicted_key,
                        "evicted least recently used response"
                    );
                }
                rebuilt
            }
            Err((rebuilt, error)) => {
                warn!(
                    target = "vitae::http::cache",
                    key = %key,
                    error = %error,
                    "Failed to buffer response; not cached"
                );
                rebuilt
            }
        }
    }

    /// Drop every CV read response; returns how many entries were removed.
    pub fn invalidate(&self) -> usize {
        let scope = cache_key(&self.prefix, CV_PATH, None);
        let mut entries = self.entries.lock_or_recover("response_invalidate");

        let mut removed = 0;
        for key in invalidation_keys(&self.prefix) {
            if entries.pop(&key).is_some() {
                removed += 1;
            }
        }
        // Query variants outside the canonical set (e.g. `format=yml`).
        let leftovers: Vec<String> = entries
            .iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&scope))
            .cloned()
            .collect();
        for key in leftovers {
            entries.pop(&key);
            removed += 1;
        }
        drop(entries);

        counter!(METRIC_INVALIDATE).increment(1);
        debug!(
            target = "vitae::http::cache",
            removed,
            "invalidated CV responses"
        );
        removed
    }
}

/// Response cache handle; `Disabled` accepts every call and does nothing.
#[derive(Clone)]
pub enum ResponseCache {
    Active(Arc<ApiResponseCache>),
    Disabled,
}

impl ResponseCache {
    pub fn from_settings(settings: &ResponseCacheSettings) -> Self {
        if settings.enabled {
            Self::Active(Arc::new(ApiResponseCache::new(settings)))
        } else {
            Self::Disabled
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn get(&self, target: &RequestTarget) -> Option<Response> {
        match self {
            Self::Active(cache) => cache.get(target),
            Self::Disabled => None,
        }
    }

    pub async fn put(&self, target: &RequestTarget, response: Response) -> Response {
        match self {
            Self::Active(cache) => cache.put(target, response).await,
            Self::Disabled => response,
        }
    }

    pub fn invalidate(&self) -> usize {
        match self {
            Self::Active(cache) => cache.invalidate(),
            Self::Disabled => 0,
        }
    }
}
