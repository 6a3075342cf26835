//! Backing key-value store for the decision engine.
//!
//! Every persisted entity lives under a prefixed key (`website:`, `snippet:`,
//! `rules:`, `analytics:`, `blocklist:`, `clicks:`). The trait exposes the
//! handful of atomic primitives the engine needs so that concurrent clicks never
//! lose counter increments or shorten a block.

mod memory;
mod redis_store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::utils::{StoreError, StoreResult};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Blocklist record as persisted; timestamps are unix milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub ip: String,
    pub blocked_at: i64,
    pub expires_at: i64,
    pub reason: String,
}

/// Key-value store primitives used by the engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Removes the key whatever its kind; returns whether something was removed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// All keys starting with `prefix`, sorted
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Applies every delta to the counter hash at `key` in one atomic step
    async fn incr_counters(&self, key: &str, deltas: &[(String, i64)]) -> StoreResult<()>;

    /// Reads the counter hash at `key`; empty when absent
    async fn counters(&self, key: &str) -> StoreResult<HashMap<String, i64>>;

    /// Atomic insert-or-extend of a blocklist record.
    ///
    /// A live record keeps its `blocked_at` and `reason` and its `expires_at`
    /// becomes the later of the stored and proposed values. A missing or expired
    /// record is replaced.
    async fn insert_or_extend(
        &self,
        key: &str,
        ip: &str,
        blocked_at: i64,
        expires_at: i64,
        reason: &str,
    ) -> StoreResult<StoredBlock>;

    async fn get_block(&self, key: &str) -> StoreResult<Option<StoredBlock>>;

    /// Deletes the record only if it is expired at `now`
    async fn remove_block_if_expired(&self, key: &str, now: i64) -> StoreResult<bool>;

    /// Adds a click to the time-ordered history at `key`
    async fn record_click(&self, key: &str, member: &str, at: i64) -> StoreResult<()>;

    /// Clicks with `from <= at <= to`
    async fn count_clicks(&self, key: &str, from: i64, to: i64) -> StoreResult<u64>;

    /// Drops clicks with `at < before`
    async fn prune_clicks(&self, key: &str, before: i64) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Runs a store future under a bounded timeout
pub async fn with_timeout<T, F>(operation: &'static str, limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Store wrapper that bounds every call with the same timeout
pub struct TimedStore {
    inner: Arc<dyn KvStore>,
    limit: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn KvStore>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl KvStore for TimedStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        with_timeout("get", self.limit, self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        with_timeout("set", self.limit, self.inner.set(key, value)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        with_timeout("delete", self.limit, self.inner.delete(key)).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        with_timeout("keys_with_prefix", self.limit, self.inner.keys_with_prefix(prefix)).await
    }

    async fn incr_counters(&self, key: &str, deltas: &[(String, i64)]) -> StoreResult<()> {
        with_timeout("incr_counters", self.limit, self.inner.incr_counters(key, deltas)).await
    }

    async fn counters(&self, key: &str) -> StoreResult<HashMap<String, i64>> {
        with_timeout("counters", self.limit, self.inner.counters(key)).await
    }

    async fn insert_or_extend(
        &self,
        key: &str,
        ip: &str,
        blocked_at: i64,
        expires_at: i64,
        reason: &str,
    ) -> StoreResult<StoredBlock> {
        with_timeout(
            "insert_or_extend",
            self.limit,
            self.inner
                .insert_or_extend(key, ip, blocked_at, expires_at, reason),
        )
        .await
    }

    async fn get_block(&self, key: &str) -> StoreResult<Option<StoredBlock>> {
        with_timeout("get_block", self.limit, self.inner.get_block(key)).await
    }

    async fn remove_block_if_expired(&self, key: &str, now: i64) -> StoreResult<bool> {
        with_timeout(
            "remove_block_if_expired",
            self.limit,
            self.inner.remove_block_if_expired(key, now),
        )
        .await
    }

    async fn record_click(&self, key: &str, member: &str, at: i64) -> StoreResult<()> {
        with_timeout("record_click", self.limit, self.inner.record_click(key, member, at)).await
    }

    async fn count_clicks(&self, key: &str, from: i64, to: i64) -> StoreResult<u64> {
        with_timeout("count_clicks", self.limit, self.inner.count_clicks(key, from, to)).await
    }

    async fn prune_clicks(&self, key: &str, before: i64) -> StoreResult<u64> {
        with_timeout("prune_clicks", self.limit, self.inner.prune_clicks(key, before)).await
    }

    async fn ping(&self) -> StoreResult<()> {
        with_timeout("ping", self.limit, self.inner.ping()).await
    }
}
