//! Request and response bodies of the HTTP API.
//!
//! IP patterns arrive as raw strings and are parsed here so that malformed input
//! surfaces as a validation error instead of a body rejection.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{
    AnalyticsView, BlockStatus, BlocklistEntry, DecisionReason, IpListEntry, IpPattern, ListKind,
    TenantRules, ThresholdRule, Verdict,
};
use crate::service::TrackOutcome;
use crate::utils::ValidationError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackClickResponse {
    pub decision: Verdict,
    pub reason: DecisionReason,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub breached_rules: Vec<String>,
    pub recorded: bool,
}

impl From<TrackOutcome> for TrackClickResponse {
    fn from(outcome: TrackOutcome) -> Self {
        Self {
            decision: outcome.decision,
            reason: outcome.reason,
            breached_rules: outcome.breached_rules,
            recorded: outcome.recorded,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterWebsiteRequest {
    pub name: String,
    pub url: String,
}

/// A list entry given either as a bare pattern or with its metadata
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IpInput {
    Pattern(String),
    Entry {
        #[serde(default)]
        id: Option<Uuid>,
        ip: String,
        #[serde(default)]
        note: Option<String>,
    },
}

impl IpInput {
    fn into_entry(self, kind: ListKind) -> Result<IpListEntry, ValidationError> {
        match self {
            IpInput::Pattern(raw) => Ok(IpListEntry::new(raw.parse()?, kind, None)),
            IpInput::Entry { id, ip, note } => {
                let mut entry = IpListEntry::new(ip.parse()?, kind, note);
                if let Some(id) = id {
                    entry.id = id;
                }
                Ok(entry)
            }
        }
    }
}

/// Whole-tenant replacement of the protection settings
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionRulesRequest {
    #[serde(default)]
    pub rules: Vec<ThresholdRule>,
    pub block_period_days: u32,
    pub refresh_rate: u32,
    #[serde(default)]
    pub manual_exclusion: Vec<IpInput>,
    #[serde(default)]
    pub whitelist: Vec<IpInput>,
}

impl ProtectionRulesRequest {
    /// Parse every pattern, keeping `added_at` of entries that already exist
    pub fn into_rules(self, current: Option<&TenantRules>) -> Result<TenantRules, ValidationError> {
        let keep_added_at = |mut entry: IpListEntry| {
            if let Some(existing) = current.and_then(|rules| {
                rules
                    .whitelist
                    .iter()
                    .chain(rules.manual_exclusion.iter())
                    .find(|other| other.ip == entry.ip)
            }) {
                entry.added_at = existing.added_at;
            }
            entry
        };

        let whitelist = self
            .whitelist
            .into_iter()
            .map(|input| input.into_entry(ListKind::Whitelist).map(keep_added_at))
            .collect::<Result<Vec<_>, _>>()?;
        let mut manual_exclusion = self
            .manual_exclusion
            .into_iter()
            .map(|input| input.into_entry(ListKind::Blacklist).map(keep_added_at))
            .collect::<Result<Vec<_>, _>>()?;
        // FIFO trimming relies on insertion order
        manual_exclusion.sort_by_key(|entry| entry.added_at);

        Ok(TenantRules {
            rules: self.rules,
            block_period_days: self.block_period_days,
            refresh_rate: self.refresh_rate,
            manual_exclusion,
            whitelist,
            updated_at: chrono::Utc::now(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct IpEntryRequest {
    pub ip: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(rename = "type")]
    pub kind: ListKind,
}

impl IpEntryRequest {
    pub fn into_entry(self) -> Result<IpListEntry, ValidationError> {
        let pattern: IpPattern = self.ip.parse()?;
        Ok(IpListEntry::new(pattern, self.kind, self.note))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpListsResponse {
    pub whitelist: Vec<IpListEntry>,
    pub manual_exclusion: Vec<IpListEntry>,
    pub refresh_rate: u32,
}

impl From<TenantRules> for IpListsResponse {
    fn from(rules: TenantRules) -> Self {
        Self {
            whitelist: rules.whitelist,
            manual_exclusion: rules.manual_exclusion,
            refresh_rate: rules.refresh_rate,
        }
    }
}

/// Current deny status of one address
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpStatusResponse {
    pub ip: String,
    pub blocked: bool,
    pub status: &'static str,
    /// Whitelist or exclusion pattern that matched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<BlocklistEntry>,
}

impl IpStatusResponse {
    pub fn new(ip: &IpAddr, status: BlockStatus) -> Self {
        let blocked = status.is_blocked();
        let (label, pattern, entry) = match status {
            BlockStatus::Whitelisted(pattern) => ("whitelisted", Some(pattern.to_string()), None),
            BlockStatus::Excluded(pattern) => ("excluded", Some(pattern.to_string()), None),
            BlockStatus::Blocked(entry) => ("blocked", None, Some(entry)),
            BlockStatus::Clear => ("clear", None, None),
        };
        Self {
            ip: ip.to_string(),
            blocked,
            status: label,
            pattern,
            entry,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnalyticsListResponse {
    pub websites: Vec<AnalyticsView>,
    pub warning: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
}
