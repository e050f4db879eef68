//! Subscriber and fetcher registry.
//!
//! Tracks, per query key, how many live [`Subscription`](crate::Subscription)
//! handles exist and which fetch function revalidates the key. Subscriber
//! counts keep entries alive across garbage collection and decide which
//! stale keys get a background refetch after invalidation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::FetchError;
use crate::key::QueryKey;
use crate::lock::{read_guard, write_guard};
use crate::retry::RetryPolicy;

/// Type-erased fetch function producing the stored value representation.
pub type BoxedFetcher =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

/// A fetch function together with its resolved per-key options.
#[derive(Clone)]
pub struct FetcherRegistration {
    pub fetcher: BoxedFetcher,
    pub stale_after: Duration,
    pub gc_after: Duration,
    pub retry: RetryPolicy,
}

/// Tracks key → fetcher and key → subscriber-count mappings.
pub struct FetcherRegistry {
    fetchers: RwLock<HashMap<QueryKey, FetcherRegistration>>,
    subscribers: RwLock<HashMap<QueryKey, usize>>,
}

impl FetcherRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            fetchers: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the fetcher used to revalidate `key`.
    pub fn register(&self, key: QueryKey, registration: FetcherRegistration) {
        write_guard(&self.fetchers, "register").insert(key, registration);
    }

    /// Get the registered fetcher for a key.
    pub fn fetcher_for(&self, key: &QueryKey) -> Option<FetcherRegistration> {
        read_guard(&self.fetchers, "fetcher_for").get(key).cloned()
    }

    /// Drop a key's fetcher registration.
    ///
    /// Called when garbage collection evicts the entry.
    pub fn unregister(&self, key: &QueryKey) {
        write_guard(&self.fetchers, "unregister").remove(key);
    }

    /// Record one more live subscription for `key`.
    pub fn subscribe(&self, key: &QueryKey) {
        *write_guard(&self.subscribers, "subscribe")
            .entry(key.clone())
            .or_insert(0) += 1;
    }

    /// Record that a subscription for `key` was dropped.
    pub fn release(&self, key: &QueryKey) {
        let mut subscribers = write_guard(&self.subscribers, "release");
        if let Some(count) = subscribers.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                subscribers.remove(key);
            }
        }
    }

    /// Number of live subscriptions for `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        read_guard(&self.subscribers, "subscriber_count")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Whether any live subscription watches `key`.
    pub fn is_active(&self, key: &QueryKey) -> bool {
        self.subscriber_count(key) > 0
    }

    /// Number of registered fetchers.
    pub fn fetcher_count(&self) -> usize {
        read_guard(&self.fetchers, "fetcher_count").len()
    }

    /// Number of keys with at least one live subscription.
    pub fn active_count(&self) -> usize {
        read_guard(&self.subscribers, "active_count").len()
    }

    /// Clear all mappings.
    pub fn clear(&self) {
        write_guard(&self.fetchers, "clear").clear();
        write_guard(&self.subscribers, "clear").clear();
    }
}

impl Default for FetcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}
