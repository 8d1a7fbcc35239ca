use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::application::kv::{BindingSlot, KvError};
use crate::application::resolver::{DataResolver, ResolveError};
use crate::domain::CvDocument;

use super::backend::{BackendError, CvBackend};

/// Server-side document store: reads resolve through the source chain,
/// writes go to the KV binding under a single key.
pub struct KvCvStore {
    binding: BindingSlot,
    key: String,
    resolver: Arc<DataResolver>,
}

impl KvCvStore {
    pub fn new(binding: BindingSlot, key: impl Into<String>, resolver: Arc<DataResolver>) -> Self {
        Self {
            binding,
            key: key.into(),
            resolver,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_writable(&self) -> bool {
        self.binding.namespace().is_some()
    }
}

#[async_trait]
impl CvBackend for KvCvStore {
    async fn fetch(&self) -> Result<CvDocument, BackendError> {
        self.resolver.resolve().await.map_err(|err| match err {
            ResolveError::Exhausted { ref failures } => {
                let tried: Vec<&str> = failures.iter().map(|failure| failure.name).collect();
                BackendError::upstream(None, format!("{err} (tried: {})", tried.join(", ")))
            }
        })
    }

    async fn save(&self, document: &CvDocument) -> Result<String, BackendError> {
        let Some(namespace) = self.binding.namespace() else {
            warn!(
                target = "vitae::cv::store",
                op = "save",
                result = "unavailable",
                binding = %self.binding.describe(),
                "Rejected write without a KV binding"
            );
            return Err(BackendError::Unavailable(self.binding.describe()));
        };

        let started_at = Instant::now();
        namespace
            .put_json(&self.key, &document.to_value())
            .await
            .map_err(|err| match err {
                KvError::Timeout(after) => BackendError::Timeout(after),
                KvError::Status { status, message } => {
                    BackendError::upstream(Some(status), message)
                }
                other => BackendError::upstream(None, other.to_string()),
            })?;

        let version = document.version();
        info!(
            target = "vitae::cv::store",
            op = "save",
            result = "ok",
            key = %self.key,
            version = %version,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Stored CV document"
        );
        Ok(version)
    }
}
