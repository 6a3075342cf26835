//! Per-tenant protection settings: threshold rules, block period, exclusion and
//! whitelist pattern lists.

use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ip_matcher::IpPattern;
use crate::config::TenantDefaults;
use crate::store::KvStore;
use crate::utils::{EngineError, EngineResult, StoreContext, ValidationError};

/// Maximum number of threshold rules a tenant may hold
pub const MAX_RULES: usize = 5;

/// Allowed block period in days
pub const BLOCK_PERIOD_RANGE: RangeInclusive<u32> = 1..=90;

/// Allowed bound on the manual exclusion list length
pub const REFRESH_RATE_RANGE: RangeInclusive<u32> = 50..=500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowUnit {
    Minutes,
    Days,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDuration {
    pub value: u32,
    pub unit: WindowUnit,
}

impl WindowDuration {
    pub fn minutes(value: u32) -> Self {
        Self {
            value,
            unit: WindowUnit::Minutes,
        }
    }

    pub fn days(value: u32) -> Self {
        Self {
            value,
            unit: WindowUnit::Days,
        }
    }

    pub fn as_seconds(&self) -> i64 {
        let value = i64::from(self.value);
        match self.unit {
            WindowUnit::Minutes => value * 60,
            WindowUnit::Days => value * 86_400,
        }
    }
}

/// Count-within-window fraud heuristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdRule {
    pub id: String,
    /// Clicks allowed inside the window before the rule is breached
    pub max_count: u32,
    pub window_duration: WindowDuration,
}

impl ThresholdRule {
    pub fn new(id: impl Into<String>, max_count: u32, window_duration: WindowDuration) -> Self {
        Self {
            id: id.into(),
            max_count,
            window_duration,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::InvalidRule("rule id is empty".to_string()));
        }
        if self.max_count == 0 {
            return Err(ValidationError::InvalidRule(format!(
                "rule {} must allow at least one click",
                self.id
            )));
        }
        if self.window_duration.value == 0 {
            return Err(ValidationError::InvalidRule(format!(
                "rule {} has an empty window",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Whitelist,
    Blacklist,
}

impl ListKind {
    fn label(self) -> &'static str {
        match self {
            ListKind::Whitelist => "whitelist",
            ListKind::Blacklist => "blacklist",
        }
    }

    fn opposite(self) -> Self {
        match self {
            ListKind::Whitelist => ListKind::Blacklist,
            ListKind::Blacklist => ListKind::Whitelist,
        }
    }
}

/// A manually managed whitelist or exclusion pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpListEntry {
    pub id: Uuid,
    pub ip: IpPattern,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(rename = "type")]
    pub kind: ListKind,
    pub added_at: DateTime<Utc>,
}

impl IpListEntry {
    pub fn new(ip: IpPattern, kind: ListKind, note: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ip,
            note,
            kind,
            added_at: Utc::now(),
        }
    }
}

/// All protection settings of one tenant, written as a whole
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRules {
    pub rules: Vec<ThresholdRule>,
    pub block_period_days: u32,
    /// Upper bound on the manual exclusion list; oldest entries go first
    pub refresh_rate: u32,
    pub manual_exclusion: Vec<IpListEntry>,
    pub whitelist: Vec<IpListEntry>,
    pub updated_at: DateTime<Utc>,
}

impl TenantRules {
    pub fn new(defaults: TenantDefaults) -> Self {
        Self {
            rules: Vec::new(),
            block_period_days: defaults.block_period_days,
            refresh_rate: defaults.refresh_rate,
            manual_exclusion: Vec::new(),
            whitelist: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Check every invariant and trim the exclusion list to its bound
    pub fn normalize(&mut self) -> Result<(), ValidationError> {
        if self.rules.len() > MAX_RULES {
            return Err(ValidationError::LimitExceeded { limit: MAX_RULES });
        }
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate()?;
            if self.rules[..i].iter().any(|other| other.id == rule.id) {
                return Err(ValidationError::DuplicateRuleId(rule.id.clone()));
            }
        }
        check_range("blockPeriodDays", self.block_period_days, &BLOCK_PERIOD_RANGE)?;
        check_range("refreshRate", self.refresh_rate, &REFRESH_RATE_RANGE)?;

        for entry in &self.whitelist {
            if self.manual_exclusion.iter().any(|other| other.ip == entry.ip) {
                return Err(ValidationError::PatternConflict(
                    entry.ip.to_string(),
                    ListKind::Blacklist.label(),
                ));
            }
        }
        for entry in self.whitelist.iter_mut() {
            entry.kind = ListKind::Whitelist;
        }
        for entry in self.manual_exclusion.iter_mut() {
            entry.kind = ListKind::Blacklist;
        }

        self.enforce_exclusion_bound();
        Ok(())
    }

    pub fn add_rule(&mut self, rule: ThresholdRule) -> Result<(), ValidationError> {
        if self.rules.len() >= MAX_RULES {
            return Err(ValidationError::LimitExceeded { limit: MAX_RULES });
        }
        rule.validate()?;
        if self.rules.iter().any(|other| other.id == rule.id) {
            return Err(ValidationError::DuplicateRuleId(rule.id));
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn set_block_period(&mut self, days: u32) -> Result<(), ValidationError> {
        check_range("blockPeriodDays", days, &BLOCK_PERIOD_RANGE)?;
        self.block_period_days = days;
        Ok(())
    }

    pub fn set_refresh_rate(&mut self, rate: u32) -> Result<(), ValidationError> {
        check_range("refreshRate", rate, &REFRESH_RATE_RANGE)?;
        self.refresh_rate = rate;
        self.enforce_exclusion_bound();
        Ok(())
    }

    /// Add a pattern to the whitelist or the manual exclusion list
    pub fn add_ip(&mut self, entry: IpListEntry) -> Result<(), ValidationError> {
        let opposite = entry.kind.opposite();
        if self.list(opposite).iter().any(|other| other.ip == entry.ip) {
            return Err(ValidationError::PatternConflict(
                entry.ip.to_string(),
                opposite.label(),
            ));
        }
        let list = self.list_mut(entry.kind);
        if list.iter().any(|other| other.ip == entry.ip) {
            return Ok(());
        }
        list.push(entry);
        self.enforce_exclusion_bound();
        Ok(())
    }

    pub fn remove_ip(&mut self, entry_id: Uuid) -> Option<IpListEntry> {
        for kind in [ListKind::Whitelist, ListKind::Blacklist] {
            let list = self.list_mut(kind);
            if let Some(pos) = list.iter().position(|entry| entry.id == entry_id) {
                return Some(list.remove(pos));
            }
        }
        None
    }

    pub fn whitelisted_by(&self, ip: &IpAddr) -> Option<&IpListEntry> {
        self.whitelist.iter().find(|entry| entry.ip.matches(ip))
    }

    pub fn excluded_by(&self, ip: &IpAddr) -> Option<&IpListEntry> {
        self.manual_exclusion.iter().find(|entry| entry.ip.matches(ip))
    }

    /// Widest rule window, the retention needed for click history
    pub fn longest_window(&self) -> Option<WindowDuration> {
        self.rules
            .iter()
            .map(|rule| rule.window_duration)
            .max_by_key(WindowDuration::as_seconds)
    }

    fn list(&self, kind: ListKind) -> &Vec<IpListEntry> {
        match kind {
            ListKind::Whitelist => &self.whitelist,
            ListKind::Blacklist => &self.manual_exclusion,
        }
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut Vec<IpListEntry> {
        match kind {
            ListKind::Whitelist => &mut self.whitelist,
            ListKind::Blacklist => &mut self.manual_exclusion,
        }
    }

    fn enforce_exclusion_bound(&mut self) {
        let bound = self.refresh_rate as usize;
        if self.manual_exclusion.len() > bound {
            let overflow = self.manual_exclusion.len() - bound;
            self.manual_exclusion.drain(..overflow);
        }
    }
}

fn check_range(field: &'static str, value: u32, range: &RangeInclusive<u32>) -> Result<(), ValidationError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: i64::from(value),
            min: i64::from(*range.start()),
            max: i64::from(*range.end()),
        })
    }
}

/// Persistence of [`TenantRules`] under `rules:{tenant}`
#[derive(Clone)]
pub struct RuleStore {
    store: Arc<dyn KvStore>,
    defaults: TenantDefaults,
}

impl RuleStore {
    pub fn new(store: Arc<dyn KvStore>, defaults: TenantDefaults) -> Self {
        Self { store, defaults }
    }

    pub fn key(tenant: &str) -> String {
        format!("rules:{}", tenant)
    }

    pub fn defaults(&self) -> TenantDefaults {
        self.defaults
    }

    pub async fn get(&self, tenant: &str) -> EngineResult<TenantRules> {
        let key = Self::key(tenant);
        let raw = self
            .store
            .get(&key)
            .await
            .in_tenant(tenant, "load_rules")?
            .ok_or_else(|| EngineError::not_found("rules", tenant))?;
        serde_json::from_str(&raw).map_err(|e| {
            EngineError::InconsistentState(format!("rules for {} cannot be decoded: {}", tenant, e))
        })
    }

    /// Whole-tenant replacement; the last writer wins
    pub async fn replace(&self, tenant: &str, mut rules: TenantRules) -> EngineResult<TenantRules> {
        rules.normalize()?;
        rules.updated_at = Utc::now();
        let raw = serde_json::to_string(&rules)
            .map_err(|e| EngineError::InconsistentState(format!("rules for {} cannot be encoded: {}", tenant, e)))?;
        self.store
            .set(&Self::key(tenant), &raw)
            .await
            .in_tenant(tenant, "save_rules")?;
        Ok(rules)
    }

    /// Store the configured defaults for a freshly registered tenant
    pub async fn initialize(&self, tenant: &str) -> EngineResult<TenantRules> {
        self.replace(tenant, TenantRules::new(self.defaults)).await
    }

    pub async fn add_rule(&self, tenant: &str, rule: ThresholdRule) -> EngineResult<TenantRules> {
        let mut rules = self.get(tenant).await?;
        rules.add_rule(rule)?;
        self.replace(tenant, rules).await
    }

    pub async fn set_block_period(&self, tenant: &str, days: u32) -> EngineResult<TenantRules> {
        let mut rules = self.get(tenant).await?;
        rules.set_block_period(days)?;
        self.replace(tenant, rules).await
    }

    pub async fn set_refresh_rate(&self, tenant: &str, rate: u32) -> EngineResult<TenantRules> {
        let mut rules = self.get(tenant).await?;
        rules.set_refresh_rate(rate)?;
        self.replace(tenant, rules).await
    }

    pub async fn add_ip_entry(&self, tenant: &str, entry: IpListEntry) -> EngineResult<IpListEntry> {
        let mut rules = self.get(tenant).await?;
        rules.add_ip(entry.clone())?;
        self.replace(tenant, rules).await?;
        Ok(entry)
    }

    pub async fn remove_ip_entry(&self, tenant: &str, entry_id: Uuid) -> EngineResult<IpListEntry> {
        let mut rules = self.get(tenant).await?;
        let removed = rules
            .remove_ip(entry_id)
            .ok_or_else(|| EngineError::not_found("ip entry", entry_id.to_string()))?;
        self.replace(tenant, rules).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio_test::{assert_err, assert_ok};

    fn rules() -> TenantRules {
        TenantRules::new(TenantDefaults::default())
    }

    fn entry(raw: &str, kind: ListKind) -> IpListEntry {
        IpListEntry::new(raw.parse().unwrap(), kind, None)
    }

    #[test]
    fn sixth_rule_is_rejected() {
        let mut r = rules();
        for i in 0..MAX_RULES {
            r.add_rule(ThresholdRule::new(format!("r{i}"), 3, WindowDuration::minutes(10)))
                .unwrap();
        }
        let err = r
            .add_rule(ThresholdRule::new("r5", 3, WindowDuration::minutes(10)))
            .unwrap_err();
        assert_eq!(err, ValidationError::LimitExceeded { limit: MAX_RULES });
    }

    #[test]
    fn block_period_bounds() {
        let mut r = rules();
        assert!(r.set_block_period(1).is_ok());
        assert!(r.set_block_period(90).is_ok());
        assert!(matches!(
            r.set_block_period(0),
            Err(ValidationError::OutOfRange { field: "blockPeriodDays", .. })
        ));
        assert!(r.set_block_period(91).is_err());
        assert_eq!(r.block_period_days, 90);
    }

    #[test]
    fn refresh_rate_evicts_oldest_exclusions() {
        let mut r = rules();
        r.set_refresh_rate(50).unwrap();
        for i in 0..60u8 {
            r.add_ip(entry(&format!("10.0.{i}.1"), ListKind::Blacklist)).unwrap();
        }
        assert_eq!(r.manual_exclusion.len(), 50);
        assert_eq!(r.manual_exclusion[0].ip.to_string(), "10.0.10.1");
        assert!(r.set_refresh_rate(501).is_err());
        assert!(r.set_refresh_rate(49).is_err());
    }

    #[test]
    fn lists_stay_disjoint() {
        let mut r = rules();
        r.add_ip(entry("10.0.0.1", ListKind::Whitelist)).unwrap();
        let err = r.add_ip(entry("10.0.0.1", ListKind::Blacklist)).unwrap_err();
        assert!(matches!(err, ValidationError::PatternConflict(_, "whitelist")));
    }

    #[test]
    fn normalize_rejects_duplicate_rule_ids() {
        let mut r = rules();
        r.rules = vec![
            ThresholdRule::new("a", 3, WindowDuration::minutes(1)),
            ThresholdRule::new("a", 5, WindowDuration::days(1)),
        ];
        assert_eq!(r.normalize(), Err(ValidationError::DuplicateRuleId("a".to_string())));
    }

    #[test]
    fn window_units_convert_to_seconds() {
        assert_eq!(WindowDuration::minutes(10).as_seconds(), 600);
        assert_eq!(WindowDuration::days(2).as_seconds(), 172_800);
    }

    #[tokio::test]
    async fn invalid_write_is_never_stored() {
        let store = RuleStore::new(Arc::new(MemoryStore::new()), TenantDefaults::default());
        store.initialize("w1").await.unwrap();

        let mut bad = store.get("w1").await.unwrap();
        bad.block_period_days = 120;
        let err = assert_err!(store.replace("w1", bad).await);
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(store.get("w1").await.unwrap().block_period_days, 7);
    }

    #[tokio::test]
    async fn lowering_refresh_rate_trims_stored_exclusions() {
        let store = RuleStore::new(Arc::new(MemoryStore::new()), TenantDefaults::default());
        store.initialize("w1").await.unwrap();
        for i in 0..60u8 {
            assert_ok!(store.add_ip_entry("w1", entry(&format!("10.1.{i}.1"), ListKind::Blacklist)).await);
        }

        let trimmed = assert_ok!(store.set_refresh_rate("w1", 50).await);
        assert_eq!(trimmed.refresh_rate, 50);

        let stored = assert_ok!(store.get("w1").await);
        assert_eq!(stored.manual_exclusion.len(), 50);
        assert_eq!(stored.manual_exclusion[0].ip.to_string(), "10.1.10.1");

        assert_err!(store.set_refresh_rate("w1", 10).await);
        assert_eq!(assert_ok!(store.get("w1").await).refresh_rate, 50);
    }

    #[tokio::test]
    async fn missing_tenant_is_not_found() {
        let store = RuleStore::new(Arc::new(MemoryStore::new()), TenantDefaults::default());
        let err = assert_err!(store.get("nope").await);
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
