//! Cache configuration.
//!
//! `CacheConfig` sets the crate-wide defaults; [`QueryOptions`] overrides
//! them per query.

use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

// Default values for cache configuration
const DEFAULT_STALE_AFTER_MS: u64 = 30_000;
const DEFAULT_GC_AFTER_MS: u64 = 300_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_REFRESH_BATCH_LIMIT: usize = 100;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;

/// Cache behavior knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Refetch subscribed keys in the background after invalidation. When
    /// off, invalidation only marks entries stale and the next access
    /// refetches lazily.
    pub enable_background_refresh: bool,
    /// Freshness window (ms) before an entry becomes eligible for
    /// revalidation.
    pub stale_after_ms: u64,
    /// Retention window (ms) for entries no active subscriber has touched.
    pub gc_after_ms: u64,
    /// Maximum retries after a transient fetch failure.
    pub max_retries: u32,
    /// Delay (ms) before the first retry.
    pub retry_base_delay_ms: u64,
    /// Upper bound (ms) on any single retry delay.
    pub retry_max_delay_ms: u64,
    /// Maximum events per refresh consumption batch.
    pub refresh_batch_limit: usize,
    /// Interval (ms) between garbage-collection sweeps.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_background_refresh: true,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            gc_after_ms: DEFAULT_GC_AFTER_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            refresh_batch_limit: DEFAULT_REFRESH_BATCH_LIMIT,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl CacheConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn gc_after(&self) -> Duration {
        Duration::from_millis(self.gc_after_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Retry policy assembled from the retry fields.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Returns the refresh batch limit, clamping to 1 if zero.
    pub fn refresh_batch_limit_non_zero(&self) -> usize {
        self.refresh_batch_limit.max(1)
    }
}

/// Per-query overrides of the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Freshness window for this key.
    pub stale_after: Option<Duration>,
    /// Retention window for this key.
    pub gc_after: Option<Duration>,
    /// Retry policy for this key's fetches.
    pub retry: Option<RetryPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enable_background_refresh);
        assert_eq!(config.stale_after_ms, 30_000);
        assert_eq!(config.gc_after_ms, 300_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay_ms, 100);
        assert_eq!(config.retry_max_delay_ms, 5_000);
        assert_eq!(config.refresh_batch_limit, 100);
        assert_eq!(config.sweep_interval_ms, 60_000);
    }

    #[test]
    fn retry_policy_mirrors_fields() {
        let config = CacheConfig {
            max_retries: 7,
            retry_base_delay_ms: 20,
            retry_max_delay_ms: 400,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.base_delay, Duration::from_millis(20));
        assert_eq!(policy.max_delay, Duration::from_millis(400));
    }

    #[test]
    fn batch_limit_clamps_to_one() {
        let config = CacheConfig {
            refresh_batch_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.refresh_batch_limit_non_zero(), 1);
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"stale_after_ms": 1000}"#).expect("config should parse");
        assert_eq!(config.stale_after_ms, 1_000);
        assert_eq!(config.gc_after_ms, 300_000);
    }

    #[test]
    fn query_options_default_to_no_overrides() {
        let options = QueryOptions::default();
        assert!(options.stale_after.is_none());
        assert!(options.gc_after.is_none());
        assert!(options.retry.is_none());
    }
}
