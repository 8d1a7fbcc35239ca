//! CV document services: the server-side store, the cached data service, and
//! the observable context built on top of it.

mod backend;
mod context;
mod service;
mod store;
pub mod transfer;

pub use backend::{BackendError, CvBackend};
pub use context::{CvDataContext, CvError, CvErrorCode, CvSnapshot, LoadingState, UpdatePhase};
pub use service::{CV_CACHE_KEY, CvDataService, CvServiceError};
pub use store::KvCvStore;
