//! Client-side value cache.
//!
//! An in-memory map of JSON values with per-entry freshness windows:
//!
//! - **fresh** (`age < ttl`): served without calling the fetcher
//! - **stale** (`ttl <= age < staleTtl`): served at once, refreshed in the background
//! - **expired**: fetched inline with retries
//!
//! Entries can be mirrored to a [`PersistentStore`] so they survive restarts.
//! Behavior is controlled via the `[cache]` table of `vitae.toml`:
//!
//! ```toml
//! [cache]
//! ttl_seconds = 300
//! stale_ttl_seconds = 3600
//! max_size_bytes = 52428800
//! cleanup_interval_seconds = 60
//! # persist_dir = "data/cache"
//! ```

mod clock;
mod config;
mod entry;
pub(crate) mod lock;
mod persist;
mod retry;
mod service;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use entry::{CacheEntry, CacheOptions, CacheStats, Freshness, estimate_size};
pub use persist::{FileStore, PersistentStore, StoreError};
pub use retry::{Exhausted, RetryPolicy};
pub use service::{BoxError, BoxFetcher, CacheError, CacheService, WarmEntry};
