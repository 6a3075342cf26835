//! Time-bounded deny records created by threshold breaches.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use super::ip_matcher::IpPattern;
use super::rule_store::TenantRules;
use crate::store::{KvStore, StoredBlock};
use crate::utils::{log_block_inserted, log_eviction, EngineError, EngineResult, StoreContext};

const KEY_PREFIX: &str = "blocklist:";

/// Single expiry predicate shared by lazy lookups and the periodic sweep
pub fn is_expired(expires_at_ms: i64, now_ms: i64) -> bool {
    expires_at_ms <= now_ms
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlocklistEntry {
    pub ip: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Id of the rule that triggered the block
    pub reason: String,
}

impl BlocklistEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.expires_at.timestamp_millis(), now.timestamp_millis())
    }
}

impl From<StoredBlock> for BlocklistEntry {
    fn from(record: StoredBlock) -> Self {
        Self {
            ip: record.ip,
            blocked_at: from_millis(record.blocked_at),
            expires_at: from_millis(record.expires_at),
            reason: record.reason,
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Why an address is or is not denied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    /// Whitelist match; beats every deny source
    Whitelisted(IpPattern),
    /// Manual exclusion pattern match
    Excluded(IpPattern),
    /// Live blocklist entry
    Blocked(BlocklistEntry),
    Clear,
}

impl BlockStatus {
    pub fn is_blocked(&self) -> bool {
        matches!(self, BlockStatus::Excluded(_) | BlockStatus::Blocked(_))
    }
}

/// Deny source for an address the whitelist has already cleared
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    Blocked(BlocklistEntry),
    Excluded(IpPattern),
}

impl From<Denial> for BlockStatus {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::Blocked(entry) => BlockStatus::Blocked(entry),
            Denial::Excluded(pattern) => BlockStatus::Excluded(pattern),
        }
    }
}

/// Blocklist persisted under `blocklist:{tenant}:{ip}`
#[derive(Clone)]
pub struct BlocklistStore {
    store: Arc<dyn KvStore>,
}

impl BlocklistStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn key(tenant: &str, ip: &IpAddr) -> String {
        format!("{}{}:{}", KEY_PREFIX, tenant, ip)
    }

    fn tenant_prefix(tenant: &str) -> String {
        format!("{}{}:", KEY_PREFIX, tenant)
    }

    /// Resolve the deny status of `ip`; the whitelist is consulted first
    ///
    /// Errors propagate; an unreachable store never reads as "not blocked".
    pub async fn status(
        &self,
        tenant: &str,
        ip: &IpAddr,
        rules: &TenantRules,
        now: DateTime<Utc>,
    ) -> EngineResult<BlockStatus> {
        if let Some(entry) = rules.whitelisted_by(ip) {
            return Ok(BlockStatus::Whitelisted(entry.ip.clone()));
        }
        Ok(self
            .denial(tenant, ip, rules, now)
            .await?
            .map_or(BlockStatus::Clear, BlockStatus::from))
    }

    /// Blocklist then exclusion lookup, skipping the whitelist
    ///
    /// Callers must have ruled out a whitelist match already.
    pub async fn denial(
        &self,
        tenant: &str,
        ip: &IpAddr,
        rules: &TenantRules,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Denial>> {
        if let Some(entry) = self.entry(tenant, ip, now).await? {
            return Ok(Some(Denial::Blocked(entry)));
        }
        Ok(rules.excluded_by(ip).map(|entry| Denial::Excluded(entry.ip.clone())))
    }

    /// Live entry for `ip`, evicting it inline when it has expired
    pub async fn entry(
        &self,
        tenant: &str,
        ip: &IpAddr,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<BlocklistEntry>> {
        let key = Self::key(tenant, ip);
        let Some(record) = self.store.get_block(&key).await.in_tenant(tenant, "blocklist_lookup")? else {
            return Ok(None);
        };
        if is_expired(record.expires_at, now.timestamp_millis()) {
            let evicted = self
                .store
                .remove_block_if_expired(&key, now.timestamp_millis())
                .await
                .in_tenant(tenant, "blocklist_evict")?;
            if evicted {
                metrics::increment_counter!("blocklist_evictions_total", "path" => "lazy");
                log_eviction("lazy", 1);
            }
            return Ok(None);
        }
        Ok(Some(record.into()))
    }

    /// Idempotent insert; an existing entry's expiry is only ever pushed later
    pub async fn block(
        &self,
        tenant: &str,
        ip: &IpAddr,
        rule_id: &str,
        block_period_days: u32,
        now: DateTime<Utc>,
    ) -> EngineResult<BlocklistEntry> {
        let expires_at = now + chrono::Duration::days(i64::from(block_period_days));
        let record = self
            .store
            .insert_or_extend(
                &Self::key(tenant, ip),
                &ip.to_string(),
                now.timestamp_millis(),
                expires_at.timestamp_millis(),
                rule_id,
            )
            .await
            .in_tenant(tenant, "blocklist_insert")?;
        let entry = BlocklistEntry::from(record);

        metrics::increment_counter!("blocklist_insertions_total");
        log_block_inserted(tenant, &entry.ip, &entry.reason, &entry.expires_at.to_rfc3339());
        Ok(entry)
    }

    /// Manual removal of a blocklist entry
    pub async fn unblock(&self, tenant: &str, ip: &IpAddr) -> EngineResult<()> {
        let removed = self
            .store
            .delete(&Self::key(tenant, ip))
            .await
            .in_tenant(tenant, "blocklist_unblock")?;
        if removed {
            Ok(())
        } else {
            Err(EngineError::not_found("blocklist entry", ip.to_string()))
        }
    }

    /// Live entries of one tenant; expired ones are evicted on the way
    pub async fn list(&self, tenant: &str, now: DateTime<Utc>) -> EngineResult<Vec<BlocklistEntry>> {
        let keys = self
            .store
            .keys_with_prefix(&Self::tenant_prefix(tenant))
            .await
            .in_tenant(tenant, "blocklist_list")?;

        let mut entries = Vec::with_capacity(keys.len());
        let mut evicted = 0;
        for key in keys {
            let Some(record) = self.store.get_block(&key).await.in_tenant(tenant, "blocklist_list")? else {
                continue;
            };
            if is_expired(record.expires_at, now.timestamp_millis()) {
                if self
                    .store
                    .remove_block_if_expired(&key, now.timestamp_millis())
                    .await
                    .in_tenant(tenant, "blocklist_evict")?
                {
                    evicted += 1;
                }
                continue;
            }
            entries.push(BlocklistEntry::from(record));
        }
        if evicted > 0 {
            metrics::counter!("blocklist_evictions_total", evicted as u64, "path" => "lazy");
            log_eviction("lazy", evicted);
        }
        Ok(entries)
    }

    /// Remove every entry with `expires_at <= now`, across all tenants
    pub async fn evict(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let keys = self
            .store
            .keys_with_prefix(KEY_PREFIX)
            .await
            .in_tenant("*", "blocklist_sweep")?;

        let mut evicted = 0;
        for key in keys {
            if self
                .store
                .remove_block_if_expired(&key, now.timestamp_millis())
                .await
                .in_tenant("*", "blocklist_sweep")?
            {
                evicted += 1;
            }
        }

        metrics::counter!("blocklist_evictions_total", evicted as u64, "path" => "sweep");
        log_eviction("sweep", evicted);
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantDefaults;
    use crate::core::rule_store::{IpListEntry, ListKind};
    use crate::store::MemoryStore;
    use chrono::Duration;
    use futures::future::join_all;
    use tokio_test::{assert_err, assert_ok};

    fn blocklist() -> BlocklistStore {
        BlocklistStore::new(Arc::new(MemoryStore::new()))
    }

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn entry_expires_after_block_period() {
        let bl = blocklist();
        let rules = TenantRules::new(TenantDefaults::default());
        let addr = ip("203.0.113.9");
        bl.block("w1", &addr, "fast", 1, t0()).await.unwrap();

        let almost = t0() + Duration::hours(23) + Duration::minutes(59);
        assert!(bl.status("w1", &addr, &rules, almost).await.unwrap().is_blocked());

        let after = t0() + Duration::hours(24) + Duration::minutes(1);
        assert!(!bl.status("w1", &addr, &rules, after).await.unwrap().is_blocked());
        // the lazy path removed it
        assert!(bl.store.get_block(&BlocklistStore::key("w1", &addr)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeated_block_keeps_one_entry_with_latest_expiry() {
        let bl = blocklist();
        let addr = ip("203.0.113.9");
        let first = bl.block("w1", &addr, "r1", 3, t0()).await.unwrap();
        let second = bl
            .block("w1", &addr, "r2", 1, t0() + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(second.expires_at, first.expires_at);
        assert_eq!(second.reason, "r1");
        assert_eq!(bl.list("w1", t0()).await.unwrap().len(), 1);

        let third = bl
            .block("w1", &addr, "r1", 3, t0() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(third.expires_at, t0() + Duration::days(4));
        assert_eq!(bl.list("w1", t0()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_blocks_converge_on_latest_expiry() {
        let bl = blocklist();
        let addr = ip("203.0.113.50");

        let attempts = (0..16u32).map(|i| {
            let bl = bl.clone();
            async move {
                bl.block("w1", &addr, &format!("r{}", i), 1 + i % 5, t0() + Duration::minutes(i64::from(i)))
                    .await
            }
        });
        let results = join_all(attempts).await;
        let latest = results
            .into_iter()
            .map(|result| assert_ok!(result).expires_at)
            .max()
            .unwrap();

        // period 5 first reached at i = 4, then again at 9 and 14
        assert_eq!(latest, t0() + Duration::minutes(14) + Duration::days(5));
        let entries = assert_ok!(bl.list("w1", t0()).await);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].expires_at, latest);
    }

    #[tokio::test]
    async fn whitelist_beats_blocklist_and_exclusion() {
        let bl = blocklist();
        let mut rules = TenantRules::new(TenantDefaults::default());
        rules
            .add_ip(IpListEntry::new("10.0.0.0/8".parse().unwrap(), ListKind::Blacklist, None))
            .unwrap();
        rules
            .add_ip(IpListEntry::new("10.0.0.1".parse().unwrap(), ListKind::Whitelist, None))
            .unwrap();

        let addr = ip("10.0.0.1");
        bl.block("w1", &addr, "r1", 30, t0()).await.unwrap();

        let status = bl.status("w1", &addr, &rules, t0()).await.unwrap();
        assert!(matches!(status, BlockStatus::Whitelisted(_)));
        assert!(!status.is_blocked());

        assert!(bl.status("w1", &ip("10.9.9.9"), &rules, t0()).await.unwrap().is_blocked());
    }

    #[tokio::test]
    async fn denial_prefers_live_entry_over_exclusion() {
        let bl = blocklist();
        let mut rules = TenantRules::new(TenantDefaults::default());
        rules
            .add_ip(IpListEntry::new("192.0.2.0/24".parse().unwrap(), ListKind::Blacklist, None))
            .unwrap();

        let listed = ip("192.0.2.10");
        let denial = assert_ok!(bl.denial("w1", &listed, &rules, t0()).await);
        assert!(matches!(denial, Some(Denial::Excluded(_))));

        bl.block("w1", &listed, "burst", 1, t0()).await.unwrap();
        let denial = assert_ok!(bl.denial("w1", &listed, &rules, t0()).await);
        assert!(matches!(denial, Some(Denial::Blocked(entry)) if entry.reason == "burst"));

        assert_eq!(assert_ok!(bl.denial("w1", &ip("8.8.8.8"), &rules, t0()).await), None);
    }

    #[tokio::test]
    async fn sweep_and_lazy_path_agree_on_boundary() {
        let bl = blocklist();
        let rules = TenantRules::new(TenantDefaults::default());
        let a = ip("198.51.100.1");
        let b = ip("198.51.100.2");
        bl.block("w1", &a, "r", 1, t0()).await.unwrap();
        bl.block("w2", &b, "r", 2, t0()).await.unwrap();

        let boundary = t0() + Duration::days(1);
        assert!(!bl.status("w1", &a, &rules, boundary).await.unwrap().is_blocked());

        bl.block("w1", &a, "r", 1, t0()).await.unwrap();
        assert_eq!(bl.evict(boundary).await.unwrap(), 1);
        assert!(bl.status("w2", &b, &rules, boundary).await.unwrap().is_blocked());
    }

    #[tokio::test]
    async fn unblock_unknown_ip_is_not_found() {
        let bl = blocklist();
        let err = assert_err!(bl.unblock("w1", &ip("1.1.1.1")).await);
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
