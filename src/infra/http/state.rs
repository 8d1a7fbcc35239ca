use std::sync::Arc;

use crate::application::cv::{CvBackend, CvDataService};
use crate::cache::{CacheService, RetryPolicy};
use crate::config::Settings;
use crate::infra::cache::ResponseCache;

use super::middleware::AdminAuth;

#[derive(Clone)]
pub struct ApiState {
    pub cv: CvDataService,
    pub responses: ResponseCache,
    pub auth: AdminAuth,
    pub max_body_bytes: usize,
}

impl ApiState {
    /// Server state over `backend`.
    ///
    /// Reads are tried once: an exhausted source chain answers the request
    /// immediately instead of being retried with backoff.
    pub async fn from_settings(settings: &Settings, backend: Arc<dyn CvBackend>) -> Self {
        let cache = CacheService::from_settings(&settings.cache, RetryPolicy::none()).await;
        Self {
            cv: CvDataService::new(cache, backend),
            responses: ResponseCache::from_settings(&settings.response_cache),
            auth: AdminAuth::new(settings.api.admin_token.as_deref()),
            max_body_bytes: settings.api.max_body_bytes,
        }
    }
}
