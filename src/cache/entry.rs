//! Entry, option, and statistics types for the value cache.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_STALE_TTL: Duration = Duration::from_secs(60 * 60);

/// A cached value with the freshness windows it was stored under.
///
/// `stale_ttl_ms >= ttl_ms` is expected but not checked; when violated the
/// stale window is empty and every expired read becomes a miss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub value: Value,
    #[serde(rename = "cachedAt")]
    pub cached_at_ms: u64,
    #[serde(rename = "ttl")]
    pub ttl_ms: u64,
    #[serde(rename = "staleTtl")]
    pub stale_ttl_ms: u64,
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

impl CacheEntry {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.cached_at_ms)
    }

    pub fn freshness(&self, now_ms: u64) -> Freshness {
        let age = self.age_ms(now_ms);
        if age < self.ttl_ms {
            Freshness::Fresh
        } else if age < self.stale_ttl_ms {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Cleanup only drops entries strictly past their stale window.
    pub fn is_past_stale_window(&self, now_ms: u64) -> bool {
        self.age_ms(now_ms) > self.stale_ttl_ms
    }
}

/// Estimated in-memory footprint: UTF-16 length of the compact JSON, two bytes per unit.
pub fn estimate_size(value: &Value) -> usize {
    serde_json::to_string(value)
        .map(|text| text.encode_utf16().count() * 2)
        .unwrap_or(0)
}

/// Per-call options for `get` and `set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub stale_ttl: Duration,
    pub force_refresh: bool,
    pub version: Option<String>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            stale_ttl: DEFAULT_STALE_TTL,
            force_refresh: false,
            version: None,
        }
    }
}

impl CacheOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_stale_ttl(mut self, stale_ttl: Duration) -> Self {
        self.stale_ttl = stale_ttl;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub entries: usize,
    pub size_bytes: usize,
    pub hit_rate: f64,
}

impl CacheStats {
    pub(crate) fn compute_hit_rate(hits: u64, stale_hits: u64, misses: u64) -> f64 {
        let served = hits + stale_hits;
        let total = served + misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(ttl_ms: u64, stale_ttl_ms: u64) -> CacheEntry {
        CacheEntry {
            value: json!({"a": 1}),
            cached_at_ms: 1_000,
            ttl_ms,
            stale_ttl_ms,
            size: 14,
            version: None,
        }
    }

    #[test]
    fn freshness_boundaries() {
        let entry = entry(100, 1_000);
        assert_eq!(entry.freshness(1_000), Freshness::Fresh);
        assert_eq!(entry.freshness(1_099), Freshness::Fresh);
        assert_eq!(entry.freshness(1_100), Freshness::Stale);
        assert_eq!(entry.freshness(1_999), Freshness::Stale);
        assert_eq!(entry.freshness(2_000), Freshness::Expired);
    }

    #[test]
    fn inverted_windows_skip_the_stale_state() {
        let entry = entry(500, 100);
        assert_eq!(entry.freshness(1_200), Freshness::Fresh);
        assert_eq!(entry.freshness(1_500), Freshness::Expired);
    }

    #[test]
    fn clock_skew_counts_as_fresh() {
        let entry = entry(100, 1_000);
        assert_eq!(entry.age_ms(500), 0);
        assert_eq!(entry.freshness(500), Freshness::Fresh);
    }

    #[test]
    fn size_uses_utf16_units() {
        assert_eq!(estimate_size(&json!({"a": 1})), 14);
        // "é" is one UTF-16 unit but two UTF-8 bytes.
        assert_eq!(estimate_size(&json!("é")), 6);
    }

    #[test]
    fn entry_persists_with_camel_case_fields() {
        let text = serde_json::to_string(&entry(100, 1_000)).unwrap();
        assert!(text.contains("\"cachedAt\":1000"));
        assert!(text.contains("\"staleTtl\":1000"));
        assert!(!text.contains("version"));
    }

    #[test]
    fn hit_rate_counts_stale_hits_as_served() {
        assert_eq!(CacheStats::compute_hit_rate(0, 0, 0), 0.0);
        assert_eq!(CacheStats::compute_hit_rate(1, 1, 2), 0.5);
    }
}
