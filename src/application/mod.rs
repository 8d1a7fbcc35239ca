//! Application services: CV resolution, storage, and state.

pub mod cv;
pub mod error;
pub mod kv;
pub mod resolver;
