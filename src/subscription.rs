//! Subscriber handles.
//!
//! A [`Subscription`] marks its key as actively used for as long as the
//! handle lives: the entry is exempt from garbage collection and gets
//! background refetches after invalidation. Dropping the handle releases
//! the key.

use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::warn;

use crate::engine::{QueryCache, QueryOutcome};
use crate::events::CacheEvent;
use crate::key::QueryKey;
use crate::store::CacheEntry;

/// Live interest in a query key.
pub struct Subscription {
    cache: QueryCache,
    key: QueryKey,
    rx: broadcast::Receiver<CacheEvent>,
}

impl Subscription {
    pub(crate) fn new(
        cache: QueryCache,
        key: QueryKey,
        rx: broadcast::Receiver<CacheEvent>,
    ) -> Self {
        Self { cache, key, rx }
    }

    /// The watched key.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Wait for the next event concerning the watched key.
    ///
    /// Returns `None` once the cache has been dropped. A slow subscriber
    /// that falls behind the broadcast buffer skips the missed events and
    /// keeps receiving.
    pub async fn changed(&mut self) -> Option<CacheEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.kind.concerns(&self.key) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "subscription lagged; events were skipped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Current outcome for the watched key, decoded as `T`.
    pub fn snapshot<T: DeserializeOwned>(&self) -> QueryOutcome<T> {
        match self.cache.peek(&self.key) {
            Some(entry) => QueryOutcome::from_entry(&entry),
            None => QueryOutcome::idle(),
        }
    }

    /// Force a revalidation of the watched key.
    pub async fn refetch(&self) -> Option<CacheEntry> {
        self.cache.refetch(&self.key).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cache.registry().release(&self.key);
    }
}
