//! Core functionality for the click fraud service.
//! This module contains the decision engine: ip matching, per-tenant rules,
//! the blocklist, the rule evaluator, analytics rollups and diagnostics.

pub mod analytics;
pub mod blocklist;
pub mod diagnostics;
pub mod evaluator;
pub mod event;
pub mod ip_matcher;
pub mod rule_store;
pub mod website;

pub use analytics::{AnalyticsAggregator, AnalyticsRollup, AnalyticsView, Overview};
pub use blocklist::{is_expired, BlockStatus, BlocklistEntry, BlocklistStore, Denial};
pub use diagnostics::{CheckStatus, DiagnosticResult, DiagnosticsReport, DiagnosticsSweep};
pub use evaluator::{Decision, DecisionReason, RuleEvaluator, Verdict};
pub use event::{BrowserFamily, ClickEvent, DeviceInfo, DeviceType, FraudSource, GeoInfo};
pub use ip_matcher::{matches, IpPattern};
pub use rule_store::{
    IpListEntry, ListKind, RuleStore, TenantRules, ThresholdRule, WindowDuration, WindowUnit,
    BLOCK_PERIOD_RANGE, MAX_RULES, REFRESH_RATE_RANGE,
};
pub use website::{Website, WebsiteRegistry};
