//! Observable CV state for UI-facing consumers.
//!
//! Loading transitions are `Idle → Loading → Idle` (first load),
//! `Idle → Refreshing → Idle` (manual refresh) and `Idle → Updating → Idle`
//! (write). An update is applied optimistically and then either committed or
//! rolled back to the previous document.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::domain::CvDocument;

use super::backend::BackendError;
use super::service::{CvDataService, CvServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingState {
    Idle,
    Loading,
    Refreshing,
    Updating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CvErrorCode {
    NotFound,
    ValidationError,
    StorageError,
    UpdateError,
    Unknown,
}

impl CvErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::StorageError => "STORAGE_ERROR",
            Self::UpdateError => "UPDATE_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for CvErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CvError {
    pub code: CvErrorCode,
    pub message: String,
}

impl CvError {
    pub fn new(code: CvErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn from_read(err: &CvServiceError) -> Self {
        let code = match err.backend() {
            Some(BackendError::NotFound) => CvErrorCode::NotFound,
            Some(BackendError::Invalid(_)) => CvErrorCode::ValidationError,
            Some(_) => CvErrorCode::StorageError,
            None => CvErrorCode::Unknown,
        };
        Self::new(code, err.to_string())
    }

    fn from_update(err: &CvServiceError) -> Self {
        let code = match err.backend() {
            Some(BackendError::Invalid(_)) => CvErrorCode::ValidationError,
            _ => CvErrorCode::UpdateError,
        };
        Self::new(code, err.to_string())
    }
}

/// Progress of the current optimistic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    /// New document visible to readers; write in flight.
    Applying,
    Committed,
    /// Write failed; previous document restored.
    RolledBack,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CvSnapshot {
    pub data: Option<CvDocument>,
    pub loading: LoadingState,
    pub error: Option<CvError>,
    pub phase: Option<UpdatePhase>,
}

impl Default for CvSnapshot {
    fn default() -> Self {
        Self {
            data: None,
            loading: LoadingState::Idle,
            error: None,
            phase: None,
        }
    }
}

pub struct CvDataContext {
    service: CvDataService,
    state: watch::Sender<CvSnapshot>,
}

impl CvDataContext {
    pub fn new(service: CvDataService) -> Self {
        let (state, _) = watch::channel(CvSnapshot::default());
        Self { service, state }
    }

    pub fn subscribe(&self) -> watch::Receiver<CvSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> CvSnapshot {
        self.state.borrow().clone()
    }

    pub fn data(&self) -> Option<CvDocument> {
        self.state.borrow().data.clone()
    }

    pub fn loading(&self) -> LoadingState {
        self.state.borrow().loading
    }

    pub fn error(&self) -> Option<CvError> {
        self.state.borrow().error.clone()
    }

    pub fn clear_error(&self) {
        self.state.send_modify(|state| state.error = None);
    }

    pub async fn load(&self) -> Result<CvDocument, CvError> {
        self.read(LoadingState::Loading, false).await
    }

    /// Bypass the cache and fetch again.
    pub async fn refresh(&self) -> Result<CvDocument, CvError> {
        self.read(LoadingState::Refreshing, true).await
    }

    async fn read(&self, loading: LoadingState, force: bool) -> Result<CvDocument, CvError> {
        self.state.send_modify(|state| state.loading = loading);

        let outcome = self.service.get_cv(force).await;
        match outcome {
            Ok(document) => {
                self.state.send_modify(|state| {
                    state.data = Some(document.clone());
                    state.error = None;
                    state.loading = LoadingState::Idle;
                });
                Ok(document)
            }
            Err(err) => {
                let error = CvError::from_read(&err);
                warn!(
                    target = "vitae::cv::context",
                    op = "read",
                    code = error.code.as_str(),
                    error = %err,
                    "Failed to load CV data"
                );
                self.state.send_modify(|state| {
                    state.error = Some(error.clone());
                    state.loading = LoadingState::Idle;
                });
                Err(error)
            }
        }
    }

    /// Replace the document optimistically and persist it.
    ///
    /// Returns the committed version. On failure the previous document is
    /// restored and the error is recorded.
    pub async fn update_data(&self, value: Value) -> Result<String, CvError> {
        let document = match CvDocument::from_value(value) {
            Ok(document) => document,
            Err(err) => {
                let error = CvError::new(CvErrorCode::ValidationError, err.to_string());
                self.state.send_modify(|state| state.error = Some(error.clone()));
                return Err(error);
            }
        };

        let mut previous = None;
        self.state.send_modify(|state| {
            previous = state.data.replace(document.clone());
            state.loading = LoadingState::Updating;
            state.phase = Some(UpdatePhase::Applying);
            state.error = None;
        });

        match self.service.save_cv(&document).await {
            Ok(version) => {
                self.state.send_modify(|state| {
                    state.phase = Some(UpdatePhase::Committed);
                    state.loading = LoadingState::Idle;
                });
                info!(
                    target = "vitae::cv::context",
                    op = "update",
                    result = "committed",
                    version = %version,
                    "CV update committed"
                );
                Ok(version)
            }
            Err(err) => {
                let error = CvError::from_update(&err);
                warn!(
                    target = "vitae::cv::context",
                    op = "update",
                    result = "rolled_back",
                    code = error.code.as_str(),
                    error = %err,
                    "CV update failed; previous document restored"
                );
                self.state.send_modify(|state| {
                    state.data = previous;
                    state.phase = Some(UpdatePhase::RolledBack);
                    state.error = Some(error.clone());
                    state.loading = LoadingState::Idle;
                });
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::application::cv::CvBackend;
    use crate::cache::{CacheConfig, CacheService, RetryPolicy};

    struct Gated {
        document: Mutex<Option<CvDocument>>,
        release: Arc<Notify>,
        reject: bool,
    }

    #[async_trait]
    impl CvBackend for Gated {
        async fn fetch(&self) -> Result<CvDocument, BackendError> {
            self.document
                .lock()
                .unwrap()
                .clone()
                .ok_or(BackendError::NotFound)
        }

        async fn save(&self, document: &CvDocument) -> Result<String, BackendError> {
            self.release.notified().await;
            if self.reject {
                return Err(BackendError::Unavailable("kv down".into()));
            }
            *self.document.lock().unwrap() = Some(document.clone());
            Ok(document.version())
        }
    }

    fn doc(name: &str) -> CvDocument {
        CvDocument::from_value(json!({"personalInfo": {"name": name}})).unwrap()
    }

    fn context(initial: Option<CvDocument>, reject: bool) -> (Arc<CvDataContext>, Arc<Notify>) {
        let release = Arc::new(Notify::new());
        let backend = Arc::new(Gated {
            document: Mutex::new(initial),
            release: release.clone(),
            reject,
        });
        let cache = CacheService::new(CacheConfig {
            retry: RetryPolicy::none(),
            ..CacheConfig::default()
        });
        let service = CvDataService::new(cache, backend);
        (Arc::new(CvDataContext::new(service)), release)
    }

    #[tokio::test]
    async fn load_populates_data_and_returns_to_idle() {
        let (ctx, _) = context(Some(doc("A")), false);
        let mut updates = ctx.subscribe();

        let loaded = ctx.load().await.unwrap();
        assert_eq!(loaded, doc("A"));
        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().loading, LoadingState::Idle);
        assert_eq!(ctx.data(), Some(doc("A")));
        assert_eq!(ctx.error(), None);
    }

    #[tokio::test]
    async fn missing_document_sets_not_found() {
        let (ctx, _) = context(None, false);
        let err = ctx.refresh().await.unwrap_err();
        assert_eq!(err.code, CvErrorCode::NotFound);
        assert_eq!(ctx.error().map(|e| e.code), Some(CvErrorCode::NotFound));
        assert_eq!(ctx.loading(), LoadingState::Idle);

        ctx.clear_error();
        assert_eq!(ctx.error(), None);
    }

    #[tokio::test]
    async fn update_is_visible_while_applying_then_committed() {
        let (ctx, release) = context(Some(doc("A")), false);
        ctx.load().await.unwrap();

        let pending = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.update_data(json!({"personalInfo": {"name": "B"}})).await }
        });
        let mut updates = ctx.subscribe();
        updates
            .wait_for(|state| state.phase == Some(UpdatePhase::Applying))
            .await
            .unwrap();
        assert_eq!(ctx.data(), Some(doc("B")));
        assert_eq!(ctx.loading(), LoadingState::Updating);

        release.notify_one();
        let version = pending.await.unwrap().unwrap();
        assert_eq!(version, doc("B").version());

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.phase, Some(UpdatePhase::Committed));
        assert_eq!(snapshot.loading, LoadingState::Idle);
        assert_eq!(snapshot.data, Some(doc("B")));
    }

    #[tokio::test]
    async fn failed_update_rolls_back() {
        let (ctx, release) = context(Some(doc("A")), true);
        ctx.load().await.unwrap();

        release.notify_one();
        let err = ctx
            .update_data(json!({"personalInfo": {"name": "B"}}))
            .await
            .unwrap_err();
        assert_eq!(err.code, CvErrorCode::UpdateError);

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.phase, Some(UpdatePhase::RolledBack));
        assert_eq!(snapshot.data, Some(doc("A")));
        assert_eq!(snapshot.error.map(|e| e.code), Some(CvErrorCode::UpdateError));
        assert_eq!(snapshot.loading, LoadingState::Idle);
    }

    #[tokio::test]
    async fn invalid_update_never_applies() {
        let (ctx, _) = context(Some(doc("A")), false);
        ctx.load().await.unwrap();

        let err = ctx.update_data(json!({"summary": 1})).await.unwrap_err();
        assert_eq!(err.code, CvErrorCode::ValidationError);
        assert_eq!(ctx.data(), Some(doc("A")));
        assert_eq!(ctx.snapshot().phase, None);
    }
}
