//! Refresh consumer.
//!
//! Drains queued invalidation events, marks matching entries stale, and
//! schedules background refetches for keys that still have live
//! subscribers. Keys without subscribers stay stale and revalidate lazily
//! on their next access.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{info, instrument};

use crate::config::CacheConfig;
use crate::events::EventQueue;
use crate::fetch::FetchExecutor;
use crate::key::QueryKey;
use crate::plan::RefreshPlan;
use crate::registry::FetcherRegistry;
use crate::store::CacheStore;
use crate::telemetry::METRIC_REFRESH_MS;

/// Executes refresh plans against the store and registry.
pub struct RefreshConsumer {
    config: CacheConfig,
    store: Arc<CacheStore>,
    registry: Arc<FetcherRegistry>,
    queue: Arc<EventQueue>,
    executor: Arc<FetchExecutor>,
}

impl RefreshConsumer {
    pub(crate) fn new(
        config: CacheConfig,
        store: Arc<CacheStore>,
        registry: Arc<FetcherRegistry>,
        queue: Arc<EventQueue>,
        executor: Arc<FetchExecutor>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            queue,
            executor,
        }
    }

    /// Consume pending events: mark stale and schedule refetches.
    ///
    /// Returns true if any events were processed.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> bool {
        self.consume_with_mode(true).await
    }

    /// Consume pending events and run only the stale-marking phase.
    ///
    /// Useful on latency-sensitive write paths where revalidation is
    /// deferred to the next access.
    #[instrument(skip(self))]
    pub async fn consume_invalidate_only(&self) -> bool {
        self.consume_with_mode(false).await
    }

    async fn consume_with_mode(&self, include_refetch: bool) -> bool {
        let started = Instant::now();
        let events = self
            .queue
            .drain(self.config.refresh_batch_limit_non_zero());
        if events.is_empty() {
            return false;
        }

        let event_count = events.len();
        let plan = RefreshPlan::from_events(events);

        info!(
            event_count,
            plan = %plan,
            include_refetch,
            "cache refresh starting"
        );

        // Phase 1: mark matching entries stale.
        let mut marked_total = 0usize;
        let mut refetch_keys: HashSet<QueryKey> = HashSet::new();
        for (prefix, epoch) in plan.stale_prefixes() {
            let marked = self.store.mark_stale(prefix, *epoch);
            marked_total += marked.len();
            if include_refetch {
                refetch_keys.extend(
                    marked
                        .into_iter()
                        .filter(|key| self.registry.is_active(key)),
                );
            }
        }

        // Phase 2: background-refetch subscribed keys. The executor dedupes
        // against fetches already in flight.
        let mut scheduled = 0usize;
        for key in refetch_keys {
            if let Some(registration) = self.registry.fetcher_for(&key) {
                Arc::clone(&self.executor).spawn(key, registration);
                scheduled += 1;
            }
        }

        info!(
            event_count,
            marked = marked_total,
            scheduled,
            "cache refresh complete"
        );

        histogram!(METRIC_REFRESH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        true
    }

    /// Get reference to the event queue.
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Get reference to the store.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Get reference to the registry.
    pub fn registry(&self) -> &Arc<FetcherRegistry> {
        &self.registry
    }
}
