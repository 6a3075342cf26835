use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KvStore, StoredBlock};
use crate::core::is_expired;
use crate::utils::StoreResult;

#[derive(Default)]
struct Inner {
    values: HashMap<String, String>,
    counters: HashMap<String, HashMap<String, i64>>,
    blocks: HashMap<String, StoredBlock>,
    clicks: HashMap<String, BTreeSet<(i64, String)>>,
}

/// In-process store for single-node deployments and tests.
///
/// Every operation runs to completion under one synchronous lock with no await
/// point inside, so each call is atomic and a cancelled caller never observes a
/// half-applied batch.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let removed = inner.values.remove(key).is_some()
            | inner.counters.remove(key).is_some()
            | inner.blocks.remove(key).is_some()
            | inner.clicks.remove(key).is_some();
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock();
        let keys: BTreeSet<&String> = inner
            .values
            .keys()
            .chain(inner.counters.keys())
            .chain(inner.blocks.keys())
            .chain(inner.clicks.keys())
            .filter(|key| key.starts_with(prefix))
            .collect();
        Ok(keys.into_iter().cloned().collect())
    }

    async fn incr_counters(&self, key: &str, deltas: &[(String, i64)]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let hash = inner.counters.entry(key.to_string()).or_default();
        for (field, delta) in deltas {
            *hash.entry(field.clone()).or_insert(0) += delta;
        }
        Ok(())
    }

    async fn counters(&self, key: &str) -> StoreResult<HashMap<String, i64>> {
        Ok(self
            .inner
            .lock()
            .counters
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_or_extend(
        &self,
        key: &str,
        ip: &str,
        blocked_at: i64,
        expires_at: i64,
        reason: &str,
    ) -> StoreResult<StoredBlock> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .blocks
            .get_mut(key)
            .filter(|block| !is_expired(block.expires_at, blocked_at))
        {
            existing.expires_at = existing.expires_at.max(expires_at);
            return Ok(existing.clone());
        }

        let fresh = StoredBlock {
            ip: ip.to_string(),
            blocked_at,
            expires_at,
            reason: reason.to_string(),
        };
        inner.blocks.insert(key.to_string(), fresh.clone());
        Ok(fresh)
    }

    async fn get_block(&self, key: &str) -> StoreResult<Option<StoredBlock>> {
        Ok(self.inner.lock().blocks.get(key).cloned())
    }

    async fn remove_block_if_expired(&self, key: &str, now: i64) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let expired = inner
            .blocks
            .get(key)
            .map_or(false, |block| is_expired(block.expires_at, now));
        if expired {
            inner.blocks.remove(key);
        }
        Ok(expired)
    }

    async fn record_click(&self, key: &str, member: &str, at: i64) -> StoreResult<()> {
        self.inner
            .lock()
            .clicks
            .entry(key.to_string())
            .or_default()
            .insert((at, member.to_string()));
        Ok(())
    }

    async fn count_clicks(&self, key: &str, from: i64, to: i64) -> StoreResult<u64> {
        let inner = self.inner.lock();
        let count = inner.clicks.get(key).map_or(0, |history| {
            history
                .iter()
                .filter(|(at, _)| (from..=to).contains(at))
                .count()
        });
        Ok(count as u64)
    }

    async fn prune_clicks(&self, key: &str, before: i64) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let Some(history) = inner.clicks.get_mut(key) else {
            return Ok(0);
        };
        let kept = history.split_off(&(before, String::new()));
        let pruned = history.len() as u64;
        *history = kept;
        if history.is_empty() {
            inner.clicks.remove(key);
        }
        Ok(pruned)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
