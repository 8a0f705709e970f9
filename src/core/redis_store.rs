//! Redis-backed counter store.
//!
//! Window records are Redis sorted sets scored by timestamp; distinct
//! member strings carry a UUID suffix so two increments in the same
//! millisecond never collapse into one entry. All multi-command updates
//! run through `redis::pipe().atomic()` so concurrent handler instances
//! serialize at the store rather than racing in the caller.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::store::{CounterStore, StoreError};

pub struct RedisCounterStore {
    client: redis::Client,
    /// Bound on every store call. The admission path gates all traffic,
    /// so an unavailable backend must turn into a quick [`StoreError`]
    /// rather than an unbounded wait.
    op_timeout: Duration,
}

impl RedisCounterStore {
    pub fn new(client: redis::Client, op_timeout: Duration) -> Self {
        Self { client, op_timeout }
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        self.bounded(self.client.get_async_connection()).await
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, timestamp_ms: i64, weight: u32) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for _ in 0..weight.max(1) {
            let member = format!("{}-{}", timestamp_ms, Uuid::new_v4());
            pipe.cmd("ZADD").arg(key).arg(timestamp_ms).arg(member).ignore();
        }
        self.bounded(pipe.query_async::<_, ()>(&mut conn)).await
    }

    async fn count_in_window(
        &self,
        key: &str,
        window_start_ms: i64,
        window_end_ms: i64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        // Lazy prune of everything at or before the boundary, then an
        // exclusive-lower-bound count so boundary entries are never
        // double counted across window slides.
        self.bounded(
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(window_start_ms)
                .query_async::<_, ()>(&mut conn),
        )
        .await?;
        self.bounded(
            redis::cmd("ZCOUNT")
                .arg(key)
                .arg(format!("({}", window_start_ms))
                .arg(window_end_ms)
                .query_async::<_, u64>(&mut conn),
        )
        .await
    }

    async fn oldest_in_window(
        &self,
        key: &str,
        window_start_ms: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.connection().await?;
        let entries: Vec<(String, i64)> = self
            .bounded(
                redis::cmd("ZRANGEBYSCORE")
                    .arg(key)
                    .arg(format!("({}", window_start_ms))
                    .arg("+inf")
                    .arg("WITHSCORES")
                    .arg("LIMIT")
                    .arg(0)
                    .arg(1)
                    .query_async::<_, Vec<(String, i64)>>(&mut conn),
            )
            .await?;
        Ok(entries.first().map(|(_, score)| *score))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(
            redis::cmd("SADD")
                .arg(key)
                .arg(member)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn set_cardinality(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(
            redis::cmd("SCARD")
                .arg(key)
                .query_async::<_, u64>(&mut conn),
        )
        .await
    }

    async fn touch_set_member(
        &self,
        key: &str,
        member: &str,
        timestamp_ms: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        // Re-adding an existing member just refreshes its score, so the
        // sorted set holds one entry per member at its last sighting.
        self.bounded(
            redis::cmd("ZADD")
                .arg(key)
                .arg(timestamp_ms)
                .arg(member)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn distinct_in_window(
        &self,
        key: &str,
        window_start_ms: i64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(window_start_ms)
                .query_async::<_, ()>(&mut conn),
        )
        .await?;
        self.bounded(redis::cmd("ZCARD").arg(key).query_async::<_, u64>(&mut conn))
            .await
    }
}
