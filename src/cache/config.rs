//! Value cache configuration.
//!
//! Controls default freshness windows, the size budget, and the cleanup cadence
//! via the `[cache]` table of `vitae.toml`.

use std::time::Duration;

use serde::Deserialize;

use super::entry::CacheOptions;
use super::retry::RetryPolicy;

const DEFAULT_TTL_SECS: u64 = 5 * 60;
const DEFAULT_STALE_TTL_SECS: u64 = 60 * 60;
const DEFAULT_MAX_SIZE_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness window applied when a caller does not pass its own.
    pub ttl_seconds: u64,
    /// Window during which an expired value may still be served while revalidating.
    pub stale_ttl_seconds: u64,
    /// Budget for the estimated serialized size of all entries.
    pub max_size_bytes: usize,
    /// Cadence of the background sweep that drops entries past their stale window.
    pub cleanup_interval_seconds: u64,
    #[serde(skip)]
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECS,
            stale_ttl_seconds: DEFAULT_STALE_TTL_SECS,
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            cleanup_interval_seconds: DEFAULT_CLEANUP_INTERVAL_SECS,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl_seconds: settings.ttl.as_secs(),
            stale_ttl_seconds: settings.stale_ttl.as_secs(),
            max_size_bytes: settings.max_size_bytes,
            cleanup_interval_seconds: settings.cleanup_interval.as_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> Duration {
        // tokio intervals panic on a zero period.
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }

    /// Options carrying this configuration's freshness windows.
    pub fn default_options(&self) -> CacheOptions {
        CacheOptions::default()
            .with_ttl(Duration::from_secs(self.ttl_seconds))
            .with_stale_ttl(Duration::from_secs(self.stale_ttl_seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl_seconds, 300);
        assert_eq!(config.stale_ttl_seconds, 3600);
        assert_eq!(config.max_size_bytes, 50 * 1024 * 1024);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn zero_cleanup_interval_is_clamped() {
        let config = CacheConfig {
            cleanup_interval_seconds: 0,
            ..Default::default()
        };
        assert_eq!(config.cleanup_interval(), Duration::from_secs(1));
    }

    #[test]
    fn default_options_follow_configuration() {
        let config = CacheConfig {
            ttl_seconds: 10,
            stale_ttl_seconds: 20,
            ..Default::default()
        };
        let options = config.default_options();
        assert_eq!(options.ttl, Duration::from_secs(10));
        assert_eq!(options.stale_ttl, Duration::from_secs(20));
        assert!(!options.force_refresh);
    }
}
