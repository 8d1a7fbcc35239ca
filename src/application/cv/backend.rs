use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::CvDocument;

/// Why the CV backend could not serve a read or accept a write.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("CV document not found")]
    NotFound,
    #[error("CV document rejected: {0}")]
    Invalid(String),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream failure: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },
}

impl BackendError {
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }
}

/// Where CV documents are read from and written to.
#[async_trait]
pub trait CvBackend: Send + Sync {
    async fn fetch(&self) -> Result<CvDocument, BackendError>;

    /// Persist `document`; returns its version.
    async fn save(&self, document: &CvDocument) -> Result<String, BackendError>;
}
