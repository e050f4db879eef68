//! Single-flight fetch execution.
//!
//! At most one fetch is in flight per key: the first caller becomes the
//! leader and runs the fetch (with retries); everyone else joins the
//! leader's completion over a watch channel and then reads the store.
//! A fetch whose callers have all gone away still completes and updates
//! the cache.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::debug;

use crate::events::{EventKind, EventQueue};
use crate::key::QueryKey;
use crate::registry::FetcherRegistration;
use crate::store::{CacheEntry, CacheStore};
use crate::telemetry::{METRIC_FETCH_ERROR_TOTAL, METRIC_FETCH_MS, METRIC_FETCH_RETRY_TOTAL};

enum Role {
    Leader(watch::Sender<()>),
    Joiner(watch::Receiver<()>),
}

pub(crate) struct FetchExecutor {
    store: Arc<CacheStore>,
    events: Arc<EventQueue>,
    in_flight: DashMap<QueryKey, watch::Receiver<()>>,
}

impl FetchExecutor {
    pub(crate) fn new(store: Arc<CacheStore>, events: Arc<EventQueue>) -> Self {
        Self {
            store,
            events,
            in_flight: DashMap::new(),
        }
    }

    /// Run the fetch for `key`, deduplicating against any fetch already in
    /// flight. Returns the resulting entry view, or `None` if the entry was
    /// removed while joining.
    pub(crate) async fn run(
        &self,
        key: &QueryKey,
        registration: &FetcherRegistration,
    ) -> Option<CacheEntry> {
        let role = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) => Role::Joiner(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(());
                vacant.insert(rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Joiner(mut done) => {
                debug!(key = %key, "joining in-flight fetch");
                // Both a completion signal and a dropped sender mean the
                // leader is finished.
                let _ = done.changed().await;
                self.store.peek(key)
            }
            Role::Leader(done) => {
                let entry = self.attempt(key, registration).await;
                self.in_flight.remove(key);
                let _ = done.send(());
                Some(entry)
            }
        }
    }

    /// Spawn a background fetch for `key`. Deduplicated like [`run`].
    pub(crate) fn spawn(self: Arc<Self>, key: QueryKey, registration: FetcherRegistration) {
        tokio::spawn(async move {
            self.run(&key, &registration).await;
        });
    }

    async fn attempt(&self, key: &QueryKey, registration: &FetcherRegistration) -> CacheEntry {
        let started = Instant::now();
        self.store
            .begin_fetch(key, registration.stale_after, registration.gc_after);

        let mut attempt = 0u32;
        loop {
            match (registration.fetcher)().await {
                Ok(value) => {
                    let epoch = self.events.next_epoch();
                    let entry = self.store.complete_fetch(
                        key,
                        Arc::new(value),
                        epoch,
                        registration.stale_after,
                        registration.gc_after,
                    );
                    self.events
                        .notify(EventKind::EntryUpdated { key: key.clone() }, epoch);
                    histogram!(METRIC_FETCH_MS)
                        .record(started.elapsed().as_secs_f64() * 1000.0);
                    debug!(key = %key, attempt, "fetch succeeded");
                    return entry;
                }
                Err(error) if registration.retry.should_retry(&error, attempt) => {
                    let delay = registration.retry.delay_for(attempt);
                    counter!(METRIC_FETCH_RETRY_TOTAL).increment(1);
                    debug!(
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    let epoch = self.events.next_epoch();
                    let entry = self.store.fail_fetch(key, error.into(), epoch);
                    self.events
                        .notify(EventKind::EntryFailed { key: key.clone() }, epoch);
                    counter!(METRIC_FETCH_ERROR_TOTAL).increment(1);
                    histogram!(METRIC_FETCH_MS)
                        .record(started.elapsed().as_secs_f64() * 1000.0);
                    debug!(key = %key, attempt, "fetch surfaced error");
                    return entry;
                }
            }
        }
    }
}
