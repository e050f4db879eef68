//! Mutation coordination.
//!
//! A mutation snapshots the entries it declares as affected, applies an
//! optimistic patch so subscribers see the change before the write
//! completes, then either commits (invalidate + background refetch) or
//! rolls back (restore every snapshot exactly).

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};

use crate::engine::QueryCache;
use crate::error::FetchError;
use crate::events::EventKind;
use crate::key::QueryKey;
use crate::store::CacheEntry;
use crate::telemetry::METRIC_ROLLBACK_TOTAL;

/// Computes the optimistic replacement for an affected entry.
///
/// Receives the key and the entry's current value (if any); returning
/// `None` leaves that entry untouched.
pub type OptimisticPatch = Arc<dyn Fn(&QueryKey, Option<&Value>) -> Option<Value> + Send + Sync>;

/// Declares which keys a mutation affects and how to patch them
/// optimistically.
#[derive(Clone, Default)]
pub struct MutationSpec {
    pub(crate) affected: Vec<QueryKey>,
    pub(crate) patch: Option<OptimisticPatch>,
}

impl MutationSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the full set of affected keys up front.
    pub fn affecting<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = QueryKey>,
    {
        Self {
            affected: keys.into_iter().collect(),
            patch: None,
        }
    }

    /// Add one affected key.
    pub fn affects(mut self, key: QueryKey) -> Self {
        self.affected.push(key);
        self
    }

    /// Attach the optimistic patch applied to every affected entry.
    pub fn with_patch<F>(mut self, patch: F) -> Self
    where
        F: Fn(&QueryKey, Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.patch = Some(Arc::new(patch));
        self
    }

    /// The declared affected keys.
    pub fn affected(&self) -> &[QueryKey] {
        &self.affected
    }
}

/// Snapshot of the affected entries as of mutation start.
///
/// Consumed by exactly one of [`commit`](Self::commit) or
/// [`rollback`](Self::rollback). The snapshot records presence and absence
/// alike, so rollback restores an entry that did not exist by removing it
/// again.
pub struct MutationContext {
    cache: QueryCache,
    affected: Vec<QueryKey>,
    snapshot: HashMap<QueryKey, Option<CacheEntry>>,
}

impl MutationContext {
    /// The captured snapshot, keyed by affected key.
    pub fn snapshot(&self) -> &HashMap<QueryKey, Option<CacheEntry>> {
        &self.snapshot
    }

    /// Discard the snapshot and invalidate every affected key.
    ///
    /// The optimistic value is a placeholder, not the source of truth:
    /// affected entries are marked stale and subscribed keys refetch in the
    /// background to reconcile with the external system.
    pub async fn commit(self) {
        info!(
            affected = self.affected.len(),
            "mutation committed, invalidating affected keys"
        );
        for key in &self.affected {
            self.cache
                .events()
                .publish(EventKind::Invalidated { prefix: key.clone() });
        }
        if self.cache.config().enable_background_refresh {
            self.cache.consumer().consume().await;
        } else {
            self.cache.consumer().consume_invalidate_only().await;
        }
    }

    /// Restore every affected entry to its snapshot state exactly and
    /// notify subscribers.
    pub fn rollback(self) {
        counter!(METRIC_ROLLBACK_TOTAL).increment(1);
        info!(affected = self.affected.len(), "mutation rolled back");
        for (key, snapshot) in self.snapshot {
            let epoch = self.cache.events().next_epoch();
            let restored = self.cache.store().restore(&key, snapshot);
            let kind = if restored {
                EventKind::EntryUpdated { key: key.clone() }
            } else {
                EventKind::EntryEvicted { key: key.clone() }
            };
            self.cache.events().notify(kind, epoch);
        }
    }
}

impl QueryCache {
    /// Capture the current state of `affected` entries for a mutation.
    ///
    /// The snapshot reflects the cache as of this call — including any
    /// optimistic patch from a mutation still in flight, so overlapping
    /// mutations roll back to their own start, not the original state.
    pub fn begin_mutation(&self, affected: &[QueryKey]) -> MutationContext {
        let snapshot = affected
            .iter()
            .map(|key| (key.clone(), self.store().peek(key)))
            .collect();
        MutationContext {
            cache: self.clone(),
            affected: affected.to_vec(),
            snapshot,
        }
    }

    /// Execute a write with optimistic cache updates.
    ///
    /// Applies the declared optimistic patch to every affected entry before awaiting
    /// `mutation`, then commits on success or rolls back on failure. The
    /// underlying result or error is returned to the caller either way.
    pub async fn mutate<T, V, F, Fut>(
        &self,
        mutation: F,
        variables: V,
        spec: MutationSpec,
    ) -> Result<T, FetchError>
    where
        F: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let context = self.begin_mutation(&spec.affected);

        if let Some(patch) = &spec.patch {
            for key in &spec.affected {
                let current = self.store().peek(key);
                let current_value = current.as_ref().and_then(|entry| entry.data.as_deref());
                if let Some(next) = patch(key, current_value) {
                    let epoch = self.events().next_epoch();
                    self.store().apply_patch(
                        key,
                        Arc::new(next),
                        epoch,
                        self.config().stale_after(),
                        self.config().gc_after(),
                    );
                    self.events()
                        .notify(EventKind::EntryUpdated { key: key.clone() }, epoch);
                    debug!(key = %key, "optimistic patch applied");
                }
            }
        }

        match mutation(variables).await {
            Ok(result) => {
                context.commit().await;
                Ok(result)
            }
            Err(error) => {
                context.rollback();
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{CacheConfig, QueryOptions};
    use crate::engine::QueryOutcome;
    use crate::store::QueryStatus;

    fn cache() -> QueryCache {
        QueryCache::new(CacheConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..Default::default()
        })
    }

    fn progress_key() -> QueryKey {
        QueryKey::of("user").with("u1").with("progress")
    }

    async fn seed(cache: &QueryCache, key: &QueryKey, value: serde_json::Value) {
        let seeded = value.clone();
        let _: QueryOutcome<serde_json::Value> = cache
            .query(
                key.clone(),
                move || {
                    let value = seeded.clone();
                    async move { Ok(value) }
                },
                QueryOptions::default(),
            )
            .await;
    }

    #[test]
    fn spec_builder_collects_keys() {
        let spec = MutationSpec::new()
            .affects(QueryKey::of("courses"))
            .affects(progress_key());
        assert_eq!(spec.affected().len(), 2);

        let spec = MutationSpec::affecting([QueryKey::of("courses")]);
        assert_eq!(spec.affected().len(), 1);
    }

    #[tokio::test]
    async fn begin_mutation_records_presence_and_absence() {
        let cache = cache();
        let present = QueryKey::of("courses");
        let absent = QueryKey::of("projects");
        seed(&cache, &present, json!(["a"])).await;

        let context = cache.begin_mutation(&[present.clone(), absent.clone()]);

        assert!(context.snapshot()[&present].is_some());
        assert!(context.snapshot()[&absent].is_none());
    }

    #[tokio::test]
    async fn failed_mutation_restores_snapshot_exactly() {
        let cache = cache();
        let key = progress_key();
        seed(&cache, &key, json!({"completedModules": ["m0"]})).await;

        let spec = MutationSpec::affecting([key.clone()]).with_patch(|_, current| {
            let mut value = current.cloned().unwrap_or_else(|| json!({}));
            if let Some(modules) = value["completedModules"].as_array_mut() {
                modules.push(json!("m1"));
            }
            Some(value)
        });

        let result: Result<(), FetchError> = cache
            .mutate(
                |_variables: ()| async { Err(FetchError::transient("write failed")) },
                (),
                spec,
            )
            .await;

        assert_eq!(result, Err(FetchError::transient("write failed")));
        let entry = cache.peek(&key).expect("entry restored");
        assert_eq!(
            entry.data.as_deref(),
            Some(&json!({"completedModules": ["m0"]}))
        );
    }

    #[tokio::test]
    async fn failed_mutation_on_absent_key_restores_absence() {
        let cache = cache();
        let key = QueryKey::of("drafts");

        let spec = MutationSpec::affecting([key.clone()])
            .with_patch(|_, _| Some(json!(["optimistic draft"])));

        let result: Result<(), FetchError> = cache
            .mutate(
                |_: ()| async { Err(FetchError::client("rejected")) },
                (),
                spec,
            )
            .await;

        assert!(result.is_err());
        assert!(cache.peek(&key).is_none());
    }

    #[tokio::test]
    async fn successful_mutation_marks_affected_stale() {
        let cache = cache();
        let key = progress_key();
        seed(&cache, &key, json!({"completedModules": ["m0"]})).await;

        let spec = MutationSpec::affecting([key.clone()]);
        let result: Result<&str, FetchError> = cache
            .mutate(|_: ()| async { Ok("done") }, (), spec)
            .await;

        assert_eq!(result, Ok("done"));
        assert!(cache.peek(&key).expect("entry").stale);
    }

    #[tokio::test]
    async fn optimistic_value_is_visible_while_write_is_in_flight() {
        let cache = cache();
        let key = progress_key();
        seed(&cache, &key, json!({"completedModules": []})).await;

        let spec = MutationSpec::affecting([key.clone()])
            .with_patch(|_, _| Some(json!({"completedModules": ["m1"]})));

        let observer = cache.clone();
        let observer_key = key.clone();
        let result: Result<(), FetchError> = cache
            .mutate(
                move |_: ()| async move {
                    // The patch must already be visible here, before the
                    // write resolves.
                    let entry = observer.peek(&observer_key).expect("patched entry");
                    assert_eq!(
                        entry.data.as_deref(),
                        Some(&json!({"completedModules": ["m1"]}))
                    );
                    assert_eq!(entry.status, QueryStatus::Success);
                    Ok(())
                },
                (),
                spec,
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn overlapping_mutations_roll_back_to_their_own_start() {
        let cache = cache();
        let key = progress_key();
        seed(&cache, &key, json!(["original"])).await;

        // First mutation patches optimistically and stays in flight.
        let first = cache.begin_mutation(&[key.clone()]);
        let epoch = cache.events().next_epoch();
        cache.store().apply_patch(
            &key,
            Arc::new(json!(["first"])),
            epoch,
            cache.config().stale_after(),
            cache.config().gc_after(),
        );

        // Second mutation starts now: its snapshot sees the first patch.
        let spec = MutationSpec::affecting([key.clone()])
            .with_patch(|_, _| Some(json!(["second"])));
        let result: Result<(), FetchError> = cache
            .mutate(
                |_: ()| async { Err(FetchError::transient("conflict")) },
                (),
                spec,
            )
            .await;
        assert!(result.is_err());

        // Rollback restored the second mutation's start state, not the
        // original value.
        let entry = cache.peek(&key).expect("entry");
        assert_eq!(entry.data.as_deref(), Some(&json!(["first"])));

        first.rollback();
        let entry = cache.peek(&key).expect("entry");
        assert_eq!(entry.data.as_deref(), Some(&json!(["original"])));
    }
}
