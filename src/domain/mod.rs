//! Domain layer types and invariants.

pub mod document;
pub mod error;

pub use document::{CvDocument, is_valid_document};
