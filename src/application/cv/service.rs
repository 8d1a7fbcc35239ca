use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheOptions, CacheService};
use crate::domain::CvDocument;

use super::backend::{BackendError, CvBackend};

pub const CV_CACHE_KEY: &str = "cv-data";

#[derive(Debug, Error)]
pub enum CvServiceError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CvServiceError {
    /// The backend failure behind this error, looking through cache retries.
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            Self::Backend(err) => Some(err),
            Self::Cache(CacheError::Fetch { source, .. }) => source.downcast_ref::<BackendError>(),
            Self::Cache(CacheError::Encode { .. }) => None,
        }
    }
}

/// Reads and writes the CV document through the value cache.
#[derive(Clone)]
pub struct CvDataService {
    cache: CacheService,
    backend: Arc<dyn CvBackend>,
    options: CacheOptions,
}

impl CvDataService {
    pub fn new(cache: CacheService, backend: Arc<dyn CvBackend>) -> Self {
        let options = cache.default_options();
        Self {
            cache,
            backend,
            options,
        }
    }

    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    pub async fn get_cv(&self, force_refresh: bool) -> Result<CvDocument, CvServiceError> {
        let backend = self.backend.clone();
        let fetcher = move || {
            let backend = backend.clone();
            async move { backend.fetch().await }
        };
        let options = self.options.clone().force_refresh(force_refresh);
        Ok(self.cache.get(CV_CACHE_KEY, fetcher, options).await?)
    }

    /// Write through the backend, then replace the cached copy.
    pub async fn save_cv(&self, document: &CvDocument) -> Result<String, CvServiceError> {
        let version = self.backend.save(document).await?;
        if let Err(err) = self.cache.set(CV_CACHE_KEY, document, &self.options).await {
            // The backend already holds the document; the next read refetches it.
            warn!(
                target = "vitae::cv::service",
                op = "save_cv",
                error = %err,
                "Saved document could not be cached"
            );
            self.cache.delete(CV_CACHE_KEY).await;
        }
        debug!(
            target = "vitae::cv::service",
            op = "save_cv",
            version = %version,
            "CV document saved"
        );
        Ok(version)
    }
}
