//! The query cache engine.
//!
//! [`QueryCache`] composes the store, registry, event queue, fetch
//! executor, and refresh consumer behind one handle. It is cheap to clone
//! (shared internals) and is passed explicitly to consumers; its lifecycle
//! belongs to the hosting application, not a process-wide singleton.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::config::{CacheConfig, QueryOptions};
use crate::consumer::RefreshConsumer;
use crate::error::{FetchError, QueryError};
use crate::events::{EventKind, EventQueue};
use crate::fetch::FetchExecutor;
use crate::key::QueryKey;
use crate::registry::{BoxedFetcher, FetcherRegistration, FetcherRegistry};
use crate::store::{CacheEntry, CacheStore, QueryStatus};
use crate::subscription::Subscription;
use crate::telemetry;

/// The result of a [`QueryCache::query`] call.
///
/// `data` and `error` can coexist: after a failed revalidation the last
/// good value is still returned alongside the error.
#[derive(Debug, Clone)]
pub struct QueryOutcome<T> {
    pub data: Option<T>,
    pub status: QueryStatus,
    pub error: Option<QueryError>,
}

impl<T: DeserializeOwned> QueryOutcome<T> {
    pub(crate) fn from_entry(entry: &CacheEntry) -> Self {
        // An entry revalidating in the background still serves its last
        // good value as a success.
        let status = match entry.status {
            QueryStatus::Fetching if entry.has_data() => QueryStatus::Success,
            other => other,
        };
        match &entry.data {
            Some(value) => match T::deserialize(value.as_ref()) {
                Ok(data) => Self {
                    data: Some(data),
                    status,
                    error: entry.error.clone(),
                },
                Err(err) => Self {
                    data: None,
                    status: QueryStatus::Error,
                    error: Some(QueryError::decode(err.to_string())),
                },
            },
            None => Self {
                data: None,
                status,
                error: entry.error.clone(),
            },
        }
    }

    pub(crate) fn idle() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
        }
    }
}

/// Stale-while-revalidate query cache with optimistic mutations.
#[derive(Clone)]
pub struct QueryCache {
    config: CacheConfig,
    store: Arc<CacheStore>,
    registry: Arc<FetcherRegistry>,
    events: Arc<EventQueue>,
    executor: Arc<FetchExecutor>,
    consumer: Arc<RefreshConsumer>,
}

impl QueryCache {
    /// Create a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        telemetry::describe_metrics();

        let store = Arc::new(CacheStore::new());
        let registry = Arc::new(FetcherRegistry::new());
        let events = Arc::new(EventQueue::new());
        let executor = Arc::new(FetchExecutor::new(Arc::clone(&store), Arc::clone(&events)));
        let consumer = Arc::new(RefreshConsumer::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&events),
            Arc::clone(&executor),
        ));

        Self {
            config,
            store,
            registry,
            events,
            executor,
            consumer,
        }
    }

    /// Request data for `key`.
    ///
    /// Serves a fresh entry without I/O; serves a stale entry immediately
    /// while revalidating in the background; otherwise awaits a
    /// deduplicated fetch. The fetch function is registered so later
    /// invalidations can revalidate the key in the background.
    pub async fn query<T, F, Fut>(
        &self,
        key: QueryKey,
        fetch: F,
        options: QueryOptions,
    ) -> QueryOutcome<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let registration = self.register_fetcher(key.clone(), fetch, options);

        if let Some(entry) = self.store.get(&key) {
            if entry.is_fresh(Instant::now()) {
                debug!(key = %key, outcome = "fresh", "serving cached value");
                return QueryOutcome::from_entry(&entry);
            }
            if entry.has_data() {
                debug!(
                    key = %key,
                    outcome = "stale",
                    "serving stale value, revalidating in background"
                );
                Arc::clone(&self.executor).spawn(key, registration);
                return QueryOutcome::from_entry(&entry);
            }
        }

        debug!(key = %key, outcome = "absent", "fetching");
        match self.executor.run(&key, &registration).await {
            Some(entry) => QueryOutcome::from_entry(&entry),
            // The entry was removed while joining an in-flight fetch.
            None => QueryOutcome::idle(),
        }
    }

    /// Open a subscription for `key`.
    ///
    /// While the handle is alive the key counts as actively used: it is
    /// exempt from garbage collection and gets background refetches after
    /// invalidation.
    pub fn subscribe(&self, key: QueryKey) -> Subscription {
        self.registry.subscribe(&key);
        Subscription::new(self.clone(), key, self.events.subscribe())
    }

    /// Mark every entry under `prefix` stale.
    ///
    /// Entries with live subscribers are refetched in the background (when
    /// background refresh is enabled); the rest revalidate lazily on next
    /// access.
    pub async fn invalidate(&self, prefix: QueryKey) {
        self.events.publish(EventKind::Invalidated { prefix });
        if self.config.enable_background_refresh {
            self.consumer.consume().await;
        } else {
            self.consumer.consume_invalidate_only().await;
        }
    }

    /// Force a revalidation of `key` through its registered fetcher.
    ///
    /// Deduplicates against any fetch already in flight. Returns the
    /// resulting entry view, or `None` when the key has no registered
    /// fetcher.
    pub async fn refetch(&self, key: &QueryKey) -> Option<CacheEntry> {
        let registration = self.registry.fetcher_for(key)?;
        self.executor.run(key, &registration).await
    }

    /// Read an entry view without touching it.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.store.peek(key)
    }

    /// Evict entries no live subscriber has touched within their retention
    /// window. Returns the number of entries evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0usize;
        for key in self.store.gc_candidates(now) {
            if self.registry.is_active(&key) {
                continue;
            }
            if self.store.remove_if_expired(&key, now) {
                self.registry.unregister(&key);
                let epoch = self.events.next_epoch();
                self.events
                    .notify(EventKind::EntryEvicted { key: key.clone() }, epoch);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "cache sweep evicted entries");
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) on the configured interval until the
    /// returned handle is aborted or dropped by the hosting application.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self
            .config
            .sweep_interval()
            .max(std::time::Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }

    /// Drop all cached entries, registrations, and queued events.
    pub fn clear(&self) {
        self.store.clear();
        self.registry.clear();
        self.events.clear();
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Get the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the underlying store.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Get the underlying registry.
    pub fn registry(&self) -> &Arc<FetcherRegistry> {
        &self.registry
    }

    /// Get the underlying event queue.
    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    /// Get the underlying refresh consumer.
    pub fn consumer(&self) -> &Arc<RefreshConsumer> {
        &self.consumer
    }

    fn register_fetcher<T, F, Fut>(
        &self,
        key: QueryKey,
        fetch: F,
        options: QueryOptions,
    ) -> FetcherRegistration
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let fetcher: BoxedFetcher = Arc::new(move || {
            let future = fetch();
            Box::pin(async move {
                let value = future.await?;
                serde_json::to_value(value).map_err(|err| {
                    FetchError::client(format!("fetched value could not be encoded: {err}"))
                })
            })
        });
        let registration = FetcherRegistration {
            fetcher,
            stale_after: options.stale_after.unwrap_or_else(|| self.config.stale_after()),
            gc_after: options.gc_after.unwrap_or_else(|| self.config.gc_after()),
            retry: options.retry.unwrap_or_else(|| self.config.retry_policy()),
        };
        self.registry.register(key, registration.clone());
        registration
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
