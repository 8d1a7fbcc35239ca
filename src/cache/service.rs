//! Stale-while-revalidate value cache.
//!
//! Lookups classify an entry by age: fresh entries are served directly, stale
//! entries are served while a detached task refreshes them, and expired or
//! missing entries are fetched inline. Values are held as JSON so one cache
//! can serve differently typed callers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::entry::{CacheEntry, CacheOptions, CacheStats, Freshness, estimate_size};
use super::lock::{MutexExt, RwLockExt};
use super::persist::{FileStore, PersistentStore};
use super::retry::RetryPolicy;
use crate::config::CacheSettings;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased fetcher used by [`CacheService::warm`].
pub type BoxFetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

const METRIC_HIT: &str = "vitae_cache_hit_total";
const METRIC_STALE_HIT: &str = "vitae_cache_stale_hit_total";
const METRIC_MISS: &str = "vitae_cache_miss_total";
const METRIC_EVICT: &str = "vitae_cache_evict_total";
const METRIC_REVALIDATE_FAILED: &str = "vitae_cache_revalidate_failed_total";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("fetch for `{key}` failed after {attempts} attempt(s): {source}")]
    Fetch {
        key: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },
    #[error("failed to encode value for `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A key plus the fetcher that produces its value, for bulk preloading.
pub struct WarmEntry<T> {
    pub key: String,
    pub fetcher: BoxFetcher<T>,
    pub options: CacheOptions,
}

impl<T: 'static> WarmEntry<T> {
    pub fn new<F, Fut, E>(key: impl Into<String>, fetcher: F, options: CacheOptions) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let fetcher: BoxFetcher<T> = Arc::new(move || {
            let pending = fetcher();
            Box::pin(async move { pending.await.map_err(Into::into) })
        });
        Self {
            key: key.into(),
            fetcher,
            options,
        }
    }
}

enum Lookup {
    Absent,
    VersionMismatch,
    Fresh(Value),
    Stale(Value),
    Expired,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
}

struct Inner {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    counters: Counters,
    store: Option<Arc<dyn PersistentStore>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = match self.sweeper.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

/// Cloneable handle to one shared cache; clones see the same entries.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<Inner>,
}

impl CacheService {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, clock, None)
    }

    /// Build a cache mirrored to `store`, loading whatever it already holds.
    pub async fn with_store(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn PersistentStore>,
    ) -> Self {
        let service = Self::build(config, clock, Some(store));
        service.restore().await;
        service
    }

    /// Cache for a process, mirrored to `persist_dir` when one is configured.
    ///
    /// A directory that cannot be opened leaves the cache memory-only.
    pub async fn from_settings(settings: &CacheSettings, retry: RetryPolicy) -> Self {
        let config = CacheConfig {
            retry,
            ..CacheConfig::from(settings)
        };
        let Some(dir) = settings.persist_dir.as_ref() else {
            return Self::new(config);
        };

        match FileStore::open(dir).await {
            Ok(store) => Self::with_store(config, Arc::new(SystemClock), Arc::new(store)).await,
            Err(err) => {
                warn!(
                    target = "vitae::cache",
                    op = "open_store",
                    dir = %dir.display(),
                    error = %err,
                    "Cache persistence unavailable; running memory-only"
                );
                Self::new(config)
            }
        }
    }

    fn build(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        store: Option<Arc<dyn PersistentStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                entries: RwLock::new(HashMap::new()),
                counters: Counters::default(),
                store,
                sweeper: Mutex::new(None),
            }),
        }
    }

    async fn restore(&self) {
        let Some(store) = self.inner.store.as_ref() else {
            return;
        };
        match store.load_all().await {
            Ok(loaded) => {
                let count = loaded.len();
                self.inner
                    .entries
                    .write_or_recover("restore")
                    .extend(loaded);
                info!(
                    target = "vitae::cache",
                    op = "restore",
                    entries = count,
                    "Loaded persisted cache entries"
                );
            }
            Err(err) => warn!(
                target = "vitae::cache",
                op = "restore",
                error = %err,
                "Failed to load persisted cache entries; starting empty"
            ),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn default_options(&self) -> CacheOptions {
        self.inner.config.default_options()
    }

    /// Return the cached value for `key`, fetching it when missing or expired.
    ///
    /// A stale value is returned immediately and refreshed in the background;
    /// failures of that refresh are only logged.
    pub async fn get<T, F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        options: CacheOptions,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if options.force_refresh {
            self.record_miss(key, "forced");
            return self.fetch_and_cache(key, &fetcher, &options).await;
        }

        let reason = match self.lookup(key, options.version.as_deref()) {
            Lookup::Fresh(value) => match self.decode::<T>(key, value) {
                Some(decoded) => {
                    self.record_hit(key);
                    return Ok(decoded);
                }
                None => "undecodable",
            },
            Lookup::Stale(value) => match self.decode::<T>(key, value) {
                Some(decoded) => {
                    self.record_stale_hit(key);
                    self.spawn_revalidation(key, fetcher, options);
                    return Ok(decoded);
                }
                None => "undecodable",
            },
            Lookup::Absent => "absent",
            Lookup::VersionMismatch => "version_mismatch",
            Lookup::Expired => "expired",
        };

        self.record_miss(key, reason);
        self.fetch_and_cache(key, &fetcher, &options).await
    }

    pub async fn set<T>(&self, key: &str, value: &T, options: &CacheOptions) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.insert_value(key, value, options).await;
        Ok(())
    }

    /// Remove `key`; returns whether an entry was present in memory.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self
            .inner
            .entries
            .write_or_recover("delete")
            .remove(key)
            .is_some();
        self.unpersist(key).await;
        removed
    }

    /// True while the entry can still be served, fresh or stale.
    pub fn has(&self, key: &str) -> bool {
        self.freshness_of(key)
            .is_some_and(|freshness| freshness != Freshness::Expired)
    }

    pub fn has_fresh(&self, key: &str) -> bool {
        self.freshness_of(key) == Some(Freshness::Fresh)
    }

    /// Copy of the raw entry, if any, without touching the counters.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.inner
            .entries
            .read_or_recover("peek")
            .get(key)
            .cloned()
    }

    /// Drop every entry. Hit/miss counters are kept.
    pub async fn clear(&self) {
        let dropped = {
            let mut entries = self.inner.entries.write_or_recover("clear");
            let count = entries.len();
            entries.clear();
            count
        };
        if let Some(store) = self.inner.store.as_ref()
            && let Err(err) = store.clear().await
        {
            warn!(
                target = "vitae::cache",
                op = "clear",
                error = %err,
                "Failed to clear persisted cache entries"
            );
        }
        debug!(target = "vitae::cache", op = "clear", dropped, "Cache cleared");
    }

    /// Preload several keys concurrently; returns how many succeeded.
    pub async fn warm<T>(&self, entries: Vec<WarmEntry<T>>) -> usize
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let tasks = entries.into_iter().map(|entry| {
            let cache = self.clone();
            async move {
                let fetcher = entry.fetcher.clone();
                let result = cache
                    .get::<T, _, _, BoxError>(&entry.key, move || fetcher(), entry.options)
                    .await;
                match result {
                    Ok(_) => true,
                    Err(err) => {
                        warn!(
                            target = "vitae::cache",
                            op = "warm",
                            key = %entry.key,
                            error = %err,
                            "Failed to warm cache entry"
                        );
                        false
                    }
                }
            }
        });
        join_all(tasks).await.into_iter().filter(|ok| *ok).count()
    }

    /// Remove entries whose age exceeds their stale window; returns the count.
    pub async fn cleanup(&self) -> usize {
        let now = self.inner.clock.now_ms();
        let mut removed = Vec::new();
        self.inner
            .entries
            .write_or_recover("cleanup")
            .retain(|key, entry| {
                if entry.is_past_stale_window(now) {
                    removed.push(key.clone());
                    false
                } else {
                    true
                }
            });

        for key in &removed {
            self.unpersist(key).await;
        }
        if !removed.is_empty() {
            debug!(
                target = "vitae::cache",
                op = "cleanup",
                removed = removed.len(),
                "Swept expired cache entries"
            );
        }
        removed.len()
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, size_bytes) = {
            let entries = self.inner.entries.read_or_recover("stats");
            (entries.len(), entries.values().map(|entry| entry.size).sum())
        };
        let counters = &self.inner.counters;
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        let stale_hits = counters.stale_hits.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            stale_hits,
            entries,
            size_bytes,
            hit_rate: CacheStats::compute_hit_rate(hits, stale_hits, misses),
        }
    }

    pub fn reset_stats(&self) {
        let counters = &self.inner.counters;
        counters.hits.store(0, Ordering::Relaxed);
        counters.misses.store(0, Ordering::Relaxed);
        counters.stale_hits.store(0, Ordering::Relaxed);
    }

    /// Start the periodic sweep. Calling it again replaces the running sweep.
    pub fn start_cleanup(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.cleanup_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                CacheService { inner }.cleanup().await;
            }
        });

        let previous = self
            .inner
            .sweeper
            .lock_or_recover("start_cleanup")
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the sweep, close the store, and empty the map. Meant for teardown.
    pub async fn destroy(&self) {
        let sweeper = self.inner.sweeper.lock_or_recover("destroy").take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
        if let Some(store) = self.inner.store.as_ref() {
            store.close().await;
        }
        self.inner.entries.write_or_recover("destroy").clear();
    }

    fn lookup(&self, key: &str, version: Option<&str>) -> Lookup {
        let now = self.inner.clock.now_ms();
        let entries = self.inner.entries.read_or_recover("lookup");
        let Some(entry) = entries.get(key) else {
            return Lookup::Absent;
        };
        if let Some(wanted) = version
            && entry.version.as_deref() != Some(wanted)
        {
            return Lookup::VersionMismatch;
        }
        match entry.freshness(now) {
            Freshness::Fresh => Lookup::Fresh(entry.value.clone()),
            Freshness::Stale => Lookup::Stale(entry.value.clone()),
            Freshness::Expired => Lookup::Expired,
        }
    }

    fn freshness_of(&self, key: &str) -> Option<Freshness> {
        let now = self.inner.clock.now_ms();
        self.inner
            .entries
            .read_or_recover("freshness_of")
            .get(key)
            .map(|entry| entry.freshness(now))
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, value: Value) -> Option<T> {
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(
                    target = "vitae::cache",
                    op = "decode",
                    key,
                    error = %err,
                    "Cached value does not match the requested type; refetching"
                );
                None
            }
        }
    }

    async fn fetch_and_cache<T, F, Fut, E>(
        &self,
        key: &str,
        fetcher: &F,
        options: &CacheOptions,
    ) -> Result<T, CacheError>
    where
        T: Serialize,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let value = self
            .inner
            .config
            .retry
            .run("cache::fetch", || {
                let pending = fetcher();
                async move { pending.await.map_err(|err| -> BoxError { err.into() }) }
            })
            .await
            .map_err(|exhausted| CacheError::Fetch {
                key: key.to_string(),
                attempts: exhausted.attempts,
                source: exhausted.error,
            })?;

        match serde_json::to_value(&value) {
            Ok(json) => self.insert_value(key, json, options).await,
            Err(err) => warn!(
                target = "vitae::cache",
                op = "fetch_and_cache",
                key,
                error = %err,
                "Fetched value could not be encoded; returning it uncached"
            ),
        }
        Ok(value)
    }

    fn spawn_revalidation<T, F, Fut, E>(&self, key: &str, fetcher: F, options: CacheOptions)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let cache = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            match cache.fetch_and_cache(&key, &fetcher, &options).await {
                Ok(_) => debug!(
                    target = "vitae::cache",
                    op = "revalidate",
                    key = %key,
                    result = "ok",
                    "Background revalidation refreshed entry"
                ),
                Err(err) => {
                    counter!(METRIC_REVALIDATE_FAILED).increment(1);
                    warn!(
                        target = "vitae::cache",
                        op = "revalidate",
                        key = %key,
                        result = "error",
                        error = %err,
                        "Background revalidation failed; stale value kept"
                    );
                }
            }
        });
    }

    async fn insert_value(&self, key: &str, value: Value, options: &CacheOptions) {
        let size = estimate_size(&value);
        for victim in self.eviction_victims(key, size) {
            self.delete(&victim).await;
            counter!(METRIC_EVICT).increment(1);
            debug!(
                target = "vitae::cache",
                op = "evict",
                key = %victim,
                "Evicted oldest entry to make room"
            );
        }

        let entry = CacheEntry {
            value,
            cached_at_ms: self.inner.clock.now_ms(),
            ttl_ms: millis(options.ttl),
            stale_ttl_ms: millis(options.stale_ttl),
            size,
            version: options.version.clone(),
        };
        self.inner
            .entries
            .write_or_recover("set")
            .insert(key.to_string(), entry.clone());

        if let Some(store) = self.inner.store.as_ref()
            && let Err(err) = store.put(key, &entry).await
        {
            warn!(
                target = "vitae::cache",
                op = "persist",
                key,
                error = %err,
                "Failed to persist cache entry"
            );
        }
    }

    /// Oldest-first keys to drop so that `incoming` more bytes fit the budget.
    fn eviction_victims(&self, key: &str, incoming: usize) -> Vec<String> {
        let max = self.inner.config.max_size_bytes;
        let entries = self.inner.entries.read_or_recover("eviction_victims");
        let mut others: Vec<(&String, &CacheEntry)> = entries
            .iter()
            .filter(|(candidate, _)| candidate.as_str() != key)
            .collect();
        let mut current: usize = others.iter().map(|(_, entry)| entry.size).sum();
        if current.saturating_add(incoming) <= max {
            return Vec::new();
        }

        others.sort_by(|(a_key, a), (b_key, b)| {
            a.cached_at_ms
                .cmp(&b.cached_at_ms)
                .then_with(|| a_key.cmp(b_key))
        });
        let mut victims = Vec::new();
        for (candidate, entry) in others {
            if current.saturating_add(incoming) <= max {
                break;
            }
            current -= entry.size;
            victims.push(candidate.clone());
        }
        victims
    }

    async fn unpersist(&self, key: &str) {
        if let Some(store) = self.inner.store.as_ref()
            && let Err(err) = store.remove(key).await
        {
            warn!(
                target = "vitae::cache",
                op = "unpersist",
                key,
                error = %err,
                "Failed to remove persisted cache entry"
            );
        }
    }

    fn record_hit(&self, key: &str) {
        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_HIT).increment(1);
        debug!(target = "vitae::cache", key, outcome = "hit", "cache hit");
    }

    fn record_stale_hit(&self, key: &str) {
        self.inner.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_STALE_HIT).increment(1);
        debug!(
            target = "vitae::cache",
            key,
            outcome = "stale",
            "serving stale value, revalidating"
        );
    }

    fn record_miss(&self, key: &str, reason: &'static str) {
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_MISS, "reason" => reason).increment(1);
        debug!(target = "vitae::cache", key, outcome = "miss", reason, "cache miss");
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
