//! vitae: CV document service with layered read-through caching.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
