//! Refresh plan generation.
//!
//! Merges a drained batch of cache events into a deduplicated set of
//! invalidation scopes for the consumer to execute.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::events::{CacheEvent, Epoch, EventKind};
use crate::key::QueryKey;

/// Invalidation scopes to execute for cache consistency.
///
/// The planner dedupes events by id and keeps one entry per distinct
/// prefix with the highest epoch seen, so repeated invalidations of the
/// same scope collapse into a single action.
#[derive(Debug, Default)]
pub struct RefreshPlan {
    stale_prefixes: Vec<(QueryKey, Epoch)>,
}

impl RefreshPlan {
    /// Merge a batch of events into a plan.
    pub fn from_events(events: Vec<CacheEvent>) -> Self {
        let mut seen_ids = HashSet::new();
        let mut merged: HashMap<QueryKey, Epoch> = HashMap::new();

        for event in events {
            if !seen_ids.insert(event.id) {
                continue;
            }
            if let EventKind::Invalidated { prefix } = event.kind {
                merged
                    .entry(prefix)
                    .and_modify(|epoch| {
                        if event.epoch > *epoch {
                            *epoch = event.epoch;
                        }
                    })
                    .or_insert(event.epoch);
            }
        }

        Self {
            stale_prefixes: merged.into_iter().collect(),
        }
    }

    /// The merged invalidation scopes with their epochs.
    pub fn stale_prefixes(&self) -> &[(QueryKey, Epoch)] {
        &self.stale_prefixes
    }

    /// Check if the plan has any actions to execute.
    pub fn is_empty(&self) -> bool {
        self.stale_prefixes.is_empty()
    }
}

impl fmt::Display for RefreshPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefreshPlan {{ prefixes: {} }}", self.stale_prefixes.len())
    }
}
