//! Cache entry storage.
//!
//! One map owns every [`CacheEntry`]; all writes replace entry data
//! atomically behind the store lock, so readers observe the old value or
//! the new one, never a torn state. Consumers only ever receive cloned
//! read-only views.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueryError;
use crate::events::Epoch;
use crate::key::QueryKey;
use crate::lock::{read_guard, write_guard};
use crate::telemetry::{METRIC_EVICT_TOTAL, METRIC_HIT_TOTAL, METRIC_MISS_TOTAL};

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

/// A stored query result.
///
/// `data` and `error` can coexist: a failed revalidation records its error
/// while the last good value stays servable.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The key this entry is stored under.
    pub key: QueryKey,
    /// Last successfully fetched (or optimistically patched) value.
    pub data: Option<Arc<Value>>,
    /// Error from the most recent failed fetch, if any.
    pub error: Option<QueryError>,
    /// Lifecycle state.
    pub status: QueryStatus,
    /// When `data` was last written.
    pub fetched_at: Option<Instant>,
    /// Freshness window measured from `fetched_at`.
    pub stale_after: Duration,
    /// Retention window measured from the last touch.
    pub gc_after: Duration,
    /// Explicit staleness mark set by invalidation.
    pub stale: bool,
    /// Epoch of the last write to this entry.
    pub epoch: Epoch,
    /// Last time any caller read or wrote this entry.
    pub last_touched: Instant,
}

impl CacheEntry {
    fn empty(key: QueryKey, stale_after: Duration, gc_after: Duration, now: Instant) -> Self {
        Self {
            key,
            data: None,
            error: None,
            status: QueryStatus::Idle,
            fetched_at: None,
            stale_after,
            gc_after,
            stale: false,
            epoch: 0,
            last_touched: now,
        }
    }

    /// Whether the entry can be served without revalidation.
    pub fn is_fresh(&self, now: Instant) -> bool {
        if self.stale || self.status != QueryStatus::Success {
            return false;
        }
        match self.fetched_at {
            Some(at) => now.saturating_duration_since(at) < self.stale_after,
            None => false,
        }
    }

    /// Whether the entry holds a servable value.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    fn gc_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_touched) >= self.gc_after
    }
}

/// The process-local entry map.
///
/// `query`, `invalidate`, `mutate`, and the sweeper are the only writers;
/// nothing else mutates cache state.
pub struct CacheStore {
    entries: RwLock<HashMap<QueryKey, CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Read an entry, counting hit/miss and refreshing its GC clock.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        let mut entries = write_guard(&self.entries, "get");
        match entries.get_mut(key) {
            Some(entry) => {
                entry.last_touched = Instant::now();
                counter!(METRIC_HIT_TOTAL).increment(1);
                Some(entry.clone())
            }
            None => {
                counter!(METRIC_MISS_TOTAL).increment(1);
                None
            }
        }
    }

    /// Read an entry without touching it or counting metrics.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry> {
        read_guard(&self.entries, "peek").get(key).cloned()
    }

    /// Transition an entry to `Fetching`, creating it if absent.
    ///
    /// Existing data and error are preserved so the last good value stays
    /// visible during revalidation.
    pub fn begin_fetch(&self, key: &QueryKey, stale_after: Duration, gc_after: Duration) {
        let now = Instant::now();
        let mut entries = write_guard(&self.entries, "begin_fetch");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::empty(key.clone(), stale_after, gc_after, now));
        entry.status = QueryStatus::Fetching;
        entry.last_touched = now;
    }

    /// Store a successful fetch result, replacing the data atomically.
    pub fn complete_fetch(
        &self,
        key: &QueryKey,
        value: Arc<Value>,
        epoch: Epoch,
        stale_after: Duration,
        gc_after: Duration,
    ) -> CacheEntry {
        let now = Instant::now();
        let mut entries = write_guard(&self.entries, "complete_fetch");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::empty(key.clone(), stale_after, gc_after, now));
        entry.data = Some(value);
        entry.error = None;
        entry.status = QueryStatus::Success;
        entry.fetched_at = Some(now);
        entry.stale = false;
        entry.epoch = epoch;
        entry.stale_after = stale_after;
        entry.gc_after = gc_after;
        entry.last_touched = now;
        entry.clone()
    }

    /// Record a failed fetch without evicting prior good data.
    pub fn fail_fetch(&self, key: &QueryKey, error: QueryError, epoch: Epoch) -> CacheEntry {
        let now = Instant::now();
        let mut entries = write_guard(&self.entries, "fail_fetch");
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            CacheEntry::empty(key.clone(), Duration::ZERO, Duration::ZERO, now)
        });
        entry.error = Some(error);
        entry.status = QueryStatus::Error;
        entry.epoch = epoch;
        entry.last_touched = now;
        entry.clone()
    }

    /// Replace an entry's data with an optimistic value.
    ///
    /// The window parameters only apply when the entry is created here.
    pub fn apply_patch(
        &self,
        key: &QueryKey,
        value: Arc<Value>,
        epoch: Epoch,
        stale_after: Duration,
        gc_after: Duration,
    ) -> CacheEntry {
        let now = Instant::now();
        let mut entries = write_guard(&self.entries, "apply_patch");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::empty(key.clone(), stale_after, gc_after, now));
        entry.data = Some(value);
        entry.error = None;
        entry.status = QueryStatus::Success;
        entry.fetched_at = Some(now);
        entry.stale = false;
        entry.epoch = epoch;
        entry.last_touched = now;
        entry.clone()
    }

    /// Restore an entry to a snapshot taken earlier, or remove it if the
    /// snapshot recorded its absence. Returns whether the entry exists
    /// afterwards.
    pub fn restore(&self, key: &QueryKey, snapshot: Option<CacheEntry>) -> bool {
        let mut entries = write_guard(&self.entries, "restore");
        match snapshot {
            Some(entry) => {
                entries.insert(key.clone(), entry);
                true
            }
            None => {
                entries.remove(key);
                false
            }
        }
    }

    /// Mark every entry under `prefix` stale, skipping entries rewritten
    /// after the invalidation epoch. Returns the keys now marked stale.
    ///
    /// Re-marking an already-stale entry is a no-op beyond the mark.
    pub fn mark_stale(&self, prefix: &QueryKey, epoch: Epoch) -> Vec<QueryKey> {
        let mut entries = write_guard(&self.entries, "mark_stale");
        let mut marked = Vec::new();
        for (key, entry) in entries.iter_mut() {
            if key.starts_with(prefix) && entry.epoch <= epoch {
                entry.stale = true;
                marked.push(key.clone());
            }
        }
        marked
    }

    /// Keys whose retention window has elapsed.
    pub fn gc_candidates(&self, now: Instant) -> Vec<QueryKey> {
        read_guard(&self.entries, "gc_candidates")
            .iter()
            .filter(|(_, entry)| entry.gc_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Remove an entry if its retention window is still elapsed.
    ///
    /// Re-checks under the write lock so a touch between candidate listing
    /// and removal keeps the entry alive.
    pub fn remove_if_expired(&self, key: &QueryKey, now: Instant) -> bool {
        let mut entries = write_guard(&self.entries, "remove_if_expired");
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.gc_expired(now));
        if expired {
            entries.remove(key);
            counter!(METRIC_EVICT_TOTAL).increment(1);
        }
        expired
    }

    /// Keys currently stored under `prefix`.
    pub fn keys_with_prefix(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        read_guard(&self.entries, "keys_with_prefix")
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        read_guard(&self.entries, "len").len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries.
    pub fn clear(&self) {
        write_guard(&self.entries, "clear").clear();
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use serde_json::json;

    use super::*;

    const STALE: Duration = Duration::from_millis(50);
    const GC: Duration = Duration::from_millis(200);

    fn courses() -> QueryKey {
        QueryKey::of("courses")
    }

    #[test]
    fn complete_fetch_roundtrip() {
        let store = CacheStore::new();
        let key = courses();

        assert!(store.get(&key).is_none());

        let entry = store.complete_fetch(&key, Arc::new(json!([{"id": 1}])), 3, STALE, GC);
        assert_eq!(entry.status, QueryStatus::Success);
        assert_eq!(entry.epoch, 3);
        assert!(entry.is_fresh(Instant::now()));

        let cached = store.get(&key).expect("cached entry");
        assert_eq!(cached.data.as_deref(), Some(&json!([{"id": 1}])));
    }

    #[test]
    fn failed_fetch_keeps_prior_data() {
        let store = CacheStore::new();
        let key = courses();

        store.complete_fetch(&key, Arc::new(json!(["v1"])), 1, STALE, GC);
        let entry = store.fail_fetch(
            &key,
            QueryError::from(crate::error::FetchError::transient("boom")),
            2,
        );

        assert_eq!(entry.status, QueryStatus::Error);
        assert!(entry.error.is_some());
        assert_eq!(entry.data.as_deref(), Some(&json!(["v1"])));
        assert!(!entry.is_fresh(Instant::now()));
    }

    #[test]
    fn freshness_window_elapses() {
        let store = CacheStore::new();
        let key = courses();
        store.complete_fetch(&key, Arc::new(json!(1)), 1, Duration::ZERO, GC);

        let entry = store.peek(&key).expect("entry");
        assert!(!entry.is_fresh(Instant::now()));
    }

    #[test]
    fn mark_stale_respects_prefix_and_epoch() {
        let store = CacheStore::new();
        let user = QueryKey::of("user").with("u1");
        let progress = user.clone().with("progress");
        let settings = user.clone().with("settings");
        let other = QueryKey::of("courses");

        store.complete_fetch(&progress, Arc::new(json!(1)), 1, STALE, GC);
        store.complete_fetch(&settings, Arc::new(json!(2)), 2, STALE, GC);
        store.complete_fetch(&other, Arc::new(json!(3)), 3, STALE, GC);

        let marked = store.mark_stale(&user, 10);
        assert_eq!(marked.len(), 2);
        assert!(store.peek(&progress).expect("progress").stale);
        assert!(store.peek(&settings).expect("settings").stale);
        assert!(!store.peek(&other).expect("courses").stale);
    }

    #[test]
    fn mark_stale_skips_entries_rewritten_after_invalidation() {
        let store = CacheStore::new();
        let key = courses();
        // Written at epoch 5, invalidation issued at epoch 4.
        store.complete_fetch(&key, Arc::new(json!(1)), 5, STALE, GC);

        let marked = store.mark_stale(&key, 4);
        assert!(marked.is_empty());
        assert!(!store.peek(&key).expect("entry").stale);
    }

    #[test]
    fn restore_roundtrips_exactly() {
        let store = CacheStore::new();
        let key = courses();

        store.complete_fetch(&key, Arc::new(json!(["original"])), 1, STALE, GC);
        let snapshot = store.peek(&key);

        store.apply_patch(&key, Arc::new(json!(["patched"])), 2, STALE, GC);
        assert_eq!(
            store.peek(&key).expect("patched").data.as_deref(),
            Some(&json!(["patched"]))
        );

        assert!(store.restore(&key, snapshot.clone()));
        let restored = store.peek(&key).expect("restored");
        let snapshot = snapshot.expect("snapshot");
        assert_eq!(restored.data.as_deref(), snapshot.data.as_deref());
        assert_eq!(restored.epoch, snapshot.epoch);
        assert_eq!(restored.status, snapshot.status);
    }

    #[test]
    fn restore_absence_removes_entry() {
        let store = CacheStore::new();
        let key = courses();
        store.complete_fetch(&key, Arc::new(json!(1)), 1, STALE, GC);

        assert!(!store.restore(&key, None));
        assert!(store.peek(&key).is_none());
    }

    #[test]
    fn views_are_torn_free() {
        let store = CacheStore::new();
        let key = courses();

        store.complete_fetch(&key, Arc::new(json!(["old"])), 1, STALE, GC);
        let view = store.peek(&key).expect("view");

        store.complete_fetch(&key, Arc::new(json!(["new"])), 2, STALE, GC);

        // The earlier view still sees the complete old value.
        assert_eq!(view.data.as_deref(), Some(&json!(["old"])));
        assert_eq!(
            store.peek(&key).expect("current").data.as_deref(),
            Some(&json!(["new"]))
        );
    }

    #[test]
    fn gc_candidates_and_removal() {
        let store = CacheStore::new();
        let key = courses();
        store.complete_fetch(&key, Arc::new(json!(1)), 1, STALE, Duration::ZERO);

        let now = Instant::now();
        let candidates = store.gc_candidates(now);
        assert_eq!(candidates, vec![key.clone()]);

        assert!(store.remove_if_expired(&key, now));
        assert!(store.peek(&key).is_none());
    }

    #[test]
    fn touch_defers_gc() {
        let store = CacheStore::new();
        let key = courses();
        store.complete_fetch(&key, Arc::new(json!(1)), 1, STALE, Duration::from_secs(60));

        assert!(store.gc_candidates(Instant::now()).is_empty());
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = CacheStore::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        store.complete_fetch(&courses(), Arc::new(json!(1)), 1, STALE, GC);
        assert_eq!(store.len(), 1);
    }
}
