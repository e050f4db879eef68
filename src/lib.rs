//! Fresco Query Cache
//!
//! A stale-while-revalidate query cache for async Rust:
//!
//! - **Deduplicated fetches**: concurrent requests for one key share a
//!   single network call.
//! - **Stale-while-revalidate**: the last good value stays visible while a
//!   background fetch reconciles it.
//! - **Prefix invalidation**: invalidating `["user", u1]` covers every key
//!   under it.
//! - **Optimistic mutations**: writes patch the cache first and roll back
//!   to an exact snapshot on failure.
//!
//! ## Usage
//!
//! ```ignore
//! let cache = QueryCache::new(CacheConfig::default());
//!
//! let courses: QueryOutcome<Vec<Course>> = cache
//!     .query(QueryKey::of("courses"), fetch_courses, QueryOptions::default())
//!     .await;
//!
//! // After an out-of-band change:
//! cache.invalidate(QueryKey::of("courses")).await;
//! ```
//!
//! Fetch and mutation functions classify failures into
//! [`FetchError::Transient`] (retried with jittered backoff) or
//! [`FetchError::Client`] (surfaced immediately) at the boundary.

pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod events;
mod fetch;
pub mod key;
mod lock;
pub mod mutation;
pub mod plan;
pub mod registry;
pub mod retry;
pub mod store;
pub mod subscription;
pub mod telemetry;

pub use config::{CacheConfig, QueryOptions};
pub use consumer::RefreshConsumer;
pub use engine::{QueryCache, QueryOutcome};
pub use error::{FetchError, QueryError};
pub use events::{CacheEvent, Epoch, EventKind, EventQueue};
pub use key::{QueryKey, Segment};
pub use mutation::{MutationContext, MutationSpec, OptimisticPatch};
pub use plan::RefreshPlan;
pub use registry::{FetcherRegistration, FetcherRegistry};
pub use retry::RetryPolicy;
pub use store::{CacheEntry, CacheStore, QueryStatus};
pub use subscription::Subscription;
