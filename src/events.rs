//! Cache event system.
//!
//! Every cache write is stamped with a monotonic epoch. Invalidation events
//! are queued for the refresh consumer and broadcast to subscribers;
//! entry-level changes are broadcast only.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::key::QueryKey;
use crate::lock::mutex_guard;
use crate::telemetry::METRIC_EVENT_QUEUE_LEN;

const NOTIFY_CHANNEL_CAPACITY: usize = 256;

/// Monotonic epoch for ordering cache writes and events.
///
/// A write stamped with a higher epoch happened after one with a lower
/// epoch; the refresh planner uses this to skip entries rewritten after an
/// invalidation was issued.
pub type Epoch = u64;

/// Cache event with idempotency and ordering support.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    /// What happened.
    pub kind: EventKind,
    /// When the event was created.
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    /// Create a new cache event with the given kind and epoch.
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Kinds of cache events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// An entry's data was replaced (fetch completion, optimistic patch, or
    /// rollback restore).
    EntryUpdated { key: QueryKey },
    /// A fetch surfaced an error after exhausting its retries.
    EntryFailed { key: QueryKey },
    /// All entries under the prefix were marked stale.
    Invalidated { prefix: QueryKey },
    /// An entry was removed by garbage collection or rollback.
    EntryEvicted { key: QueryKey },
}

impl EventKind {
    /// Whether a subscriber watching `watched` should see this event.
    ///
    /// Entry-level events are delivered for the watched key and anything
    /// under it; invalidations are delivered whenever the scopes overlap in
    /// either direction.
    pub fn concerns(&self, watched: &QueryKey) -> bool {
        match self {
            EventKind::EntryUpdated { key }
            | EventKind::EntryFailed { key }
            | EventKind::EntryEvicted { key } => key.starts_with(watched),
            EventKind::Invalidated { prefix } => {
                watched.starts_with(prefix) || prefix.starts_with(watched)
            }
        }
    }
}

/// In-memory event queue with an attached subscriber broadcast.
///
/// Invalidation events are published by write paths and drained by the
/// refresh consumer. The queue uses a mutex since contention is expected to
/// be low.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    epoch_counter: AtomicU64,
    notifier: broadcast::Sender<CacheEvent>,
}

impl EventQueue {
    /// Create a new empty event queue.
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            notifier,
        }
    }

    /// Get the next epoch number.
    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueue an event for the refresh consumer and broadcast it.
    ///
    /// Returns the epoch stamped on the event.
    pub fn publish(&self, kind: EventKind) -> Epoch {
        let epoch = self.next_epoch();
        let event = CacheEvent::new(kind, epoch);

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "cache event enqueued"
        );

        let len = {
            let mut queue = mutex_guard(&self.queue, "publish");
            queue.push_back(event.clone());
            queue.len()
        };
        gauge!(METRIC_EVENT_QUEUE_LEN).set(len as f64);

        let _ = self.notifier.send(event);
        epoch
    }

    /// Broadcast an entry-level event at a previously allocated epoch
    /// without enqueueing it.
    pub fn notify(&self, kind: EventKind, epoch: Epoch) {
        let event = CacheEvent::new(kind, epoch);
        debug!(
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "cache change broadcast"
        );
        let _ = self.notifier.send(event);
    }

    /// Open a broadcast receiver for cache events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.notifier.subscribe()
    }

    /// Drain up to `limit` events from the queue in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let (events, len) = {
            let mut queue = mutex_guard(&self.queue, "drain");
            let count = limit.min(queue.len());
            let events: Vec<CacheEvent> = queue.drain(..count).collect();
            (events, queue.len())
        };
        gauge!(METRIC_EVENT_QUEUE_LEN).set(len as f64);
        events
    }

    /// Get the current queue length.
    pub fn len(&self) -> usize {
        mutex_guard(&self.queue, "len").len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all queued events.
    pub fn clear(&self) {
        mutex_guard(&self.queue, "clear").clear();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(0.0);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
