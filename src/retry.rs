//! Retry policy for fetch failures.
//!
//! Transient failures back off exponentially with jitter; client failures
//! are never retried.

use std::time::Duration;

use rand::Rng;

use crate::error::FetchError;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 100;
const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

// Caps the exponent so the shift below cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Backoff schedule applied to transient fetch failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of re-attempts after the initial call.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether `error` may be re-attempted after `attempt` completed calls.
    pub fn should_retry(&self, error: &FetchError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_retries
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// Doubles per attempt from `base_delay` up to `max_delay`, then picks a
    /// uniform point in the upper half of that window so that synchronized
    /// clients spread out.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exponential = base.saturating_mul(1u64 << attempt.min(MAX_BACKOFF_EXPONENT));
        let capped = exponential.min(self.max_delay.as_millis() as u64).max(1);
        let jittered = rand::rng().random_range(capped / 2..=capped);
        Duration::from_millis(jittered)
    }
}
