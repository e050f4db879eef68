//! Metric names and descriptions.
//!
//! The crate records metrics through the [`metrics`] facade; the hosting
//! application decides where they go by installing a recorder.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

pub const METRIC_HIT_TOTAL: &str = "fresco_cache_hit_total";
pub const METRIC_MISS_TOTAL: &str = "fresco_cache_miss_total";
pub const METRIC_EVICT_TOTAL: &str = "fresco_cache_evict_total";
pub const METRIC_FETCH_RETRY_TOTAL: &str = "fresco_cache_fetch_retry_total";
pub const METRIC_FETCH_ERROR_TOTAL: &str = "fresco_cache_fetch_error_total";
pub const METRIC_ROLLBACK_TOTAL: &str = "fresco_cache_rollback_total";
pub const METRIC_EVENT_QUEUE_LEN: &str = "fresco_cache_event_queue_len";
pub const METRIC_FETCH_MS: &str = "fresco_cache_fetch_ms";
pub const METRIC_REFRESH_MS: &str = "fresco_cache_refresh_ms";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Register metric descriptions with the installed recorder.
///
/// Safe to call repeatedly; descriptions are registered once per process.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_HIT_TOTAL,
            Unit::Count,
            "Total number of cache reads served from a stored entry."
        );
        describe_counter!(
            METRIC_MISS_TOTAL,
            Unit::Count,
            "Total number of cache reads that found no stored entry."
        );
        describe_counter!(
            METRIC_EVICT_TOTAL,
            Unit::Count,
            "Total number of entries evicted by garbage collection."
        );
        describe_counter!(
            METRIC_FETCH_RETRY_TOTAL,
            Unit::Count,
            "Total number of fetch attempts re-issued after a transient failure."
        );
        describe_counter!(
            METRIC_FETCH_ERROR_TOTAL,
            Unit::Count,
            "Total number of fetches that surfaced an error after retries."
        );
        describe_counter!(
            METRIC_ROLLBACK_TOTAL,
            Unit::Count,
            "Total number of mutations rolled back to their snapshot."
        );
        describe_gauge!(
            METRIC_EVENT_QUEUE_LEN,
            Unit::Count,
            "Current number of invalidation events awaiting consumption."
        );
        describe_histogram!(
            METRIC_FETCH_MS,
            Unit::Milliseconds,
            "Latency of a fetch including retries."
        );
        describe_histogram!(
            METRIC_REFRESH_MS,
            Unit::Milliseconds,
            "Latency of one refresh consumption pass."
        );
    });
}
