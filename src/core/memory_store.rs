//! In-process counter store with the same window semantics as the Redis
//! implementation. Used by tests and local development; a production
//! deployment with more than one handler instance must use Redis, since
//! this store is only shared within a single process.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::store::{CounterStore, StoreError};

#[derive(Default)]
struct Inner {
    windows: HashMap<String, Vec<i64>>,
    sets: HashMap<String, HashSet<String>>,
    /// member → last-seen timestamp, per key.
    members: HashMap<String, HashMap<String, i64>>,
}

/// Deterministic in-memory [`CounterStore`].
#[derive(Default)]
pub struct MemoryCounterStore {
    inner: Mutex<Inner>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw entry count for a window key, ignoring window bounds.
    /// Lets tests assert that a short-circuited request consumed no quota.
    pub fn entry_count(&self, key: &str) -> usize {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.windows.get(key).map(|w| w.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, timestamp_ms: i64, weight: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let window = inner.windows.entry(key.to_string()).or_default();
        for _ in 0..weight.max(1) {
            window.push(timestamp_ms);
        }
        Ok(())
    }

    async fn count_in_window(
        &self,
        key: &str,
        window_start_ms: i64,
        window_end_ms: i64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let Some(window) = inner.windows.get_mut(key) else {
            return Ok(0);
        };
        // Lazy prune: the exclusive lower bound drops entries exactly at
        // the window boundary, matching the Redis ZREMRANGEBYSCORE range.
        window.retain(|ts| *ts > window_start_ms);
        Ok(window.iter().filter(|ts| **ts <= window_end_ms).count() as u64)
    }

    async fn oldest_in_window(
        &self,
        key: &str,
        window_start_ms: i64,
    ) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .windows
            .get(key)
            .and_then(|w| w.iter().filter(|ts| **ts > window_start_ms).min().copied()))
    }

    async fn expire(&self, _key: &str, _ttl_secs: u64) -> Result<(), StoreError> {
        // Entries already age out through window pruning; wall-clock TTL
        // only matters for a shared backend.
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_cardinality(&self, key: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn touch_set_member(
        &self,
        key: &str,
        member: &str,
        timestamp_ms: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .members
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), timestamp_ms);
        Ok(())
    }

    async fn distinct_in_window(
        &self,
        key: &str,
        window_start_ms: i64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let Some(members) = inner.members.get_mut(key) else {
            return Ok(0);
        };
        members.retain(|_, last_seen| *last_seen > window_start_ms);
        Ok(members.len() as u64)
    }
}
