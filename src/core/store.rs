//! Shared counter store abstraction for the admission control service.
//!
//! Every quota-tracking component (rate limiter, behavioral analyzer,
//! DDoS detector) goes through this trait so that cross-request state
//! lives in an external atomic store rather than in-process memory.
//! Handler instances are stateless and run in parallel, so all updates
//! must be atomic at the store; callers never read-modify-write.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by counter store operations.
///
/// A store error means the counter state is *unknown*, not that the
/// request is denied. Callers on the admission path fail open.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Atomic sliding-window counter and set operations.
///
/// Window entries are timestamped (milliseconds). The window lower bound
/// is exclusive everywhere: an entry with `timestamp == window_start_ms`
/// has already slid out and is never counted.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Append `weight` entries at `timestamp_ms` to the sorted window
    /// under `key`. A flagged request inserts more than one entry, which
    /// is how penalty multipliers consume quota faster.
    async fn increment(&self, key: &str, timestamp_ms: i64, weight: u32) -> Result<(), StoreError>;

    /// Prune entries at or before `window_start_ms`, then count entries in
    /// `(window_start_ms, window_end_ms]`.
    async fn count_in_window(
        &self,
        key: &str,
        window_start_ms: i64,
        window_end_ms: i64,
    ) -> Result<u64, StoreError>;

    /// Timestamp of the oldest entry strictly inside the window, if any.
    async fn oldest_in_window(
        &self,
        key: &str,
        window_start_ms: i64,
    ) -> Result<Option<i64>, StoreError>;

    /// Bound the key's lifetime so abandoned identities expire at the
    /// store, never via an in-process timer.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Add `member` to the set under `key`.
    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Number of distinct members in the set under `key`.
    async fn set_cardinality(&self, key: &str) -> Result<u64, StoreError>;

    /// Record `member` as active at `timestamp_ms`, keeping only its
    /// most recent sighting.
    async fn touch_set_member(
        &self,
        key: &str,
        member: &str,
        timestamp_ms: i64,
    ) -> Result<(), StoreError>;

    /// Prune members last seen at or before `window_start_ms`, then
    /// count the distinct members remaining.
    async fn distinct_in_window(
        &self,
        key: &str,
        window_start_ms: i64,
    ) -> Result<u64, StoreError>;
}

/// Store stub whose every operation fails, for exercising fail-open paths.
#[cfg(test)]
pub(crate) struct FailingCounterStore;

#[cfg(test)]
#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn increment(&self, _: &str, _: i64, _: u32) -> Result<(), StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(50)))
    }

    async fn count_in_window(&self, _: &str, _: i64, _: i64) -> Result<u64, StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(50)))
    }

    async fn oldest_in_window(&self, _: &str, _: i64) -> Result<Option<i64>, StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(50)))
    }

    async fn expire(&self, _: &str, _: u64) -> Result<(), StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(50)))
    }

    async fn add_to_set(&self, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(50)))
    }

    async fn set_cardinality(&self, _: &str) -> Result<u64, StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(50)))
    }

    async fn touch_set_member(&self, _: &str, _: &str, _: i64) -> Result<(), StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(50)))
    }

    async fn distinct_in_window(&self, _: &str, _: i64) -> Result<u64, StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(50)))
    }
}
