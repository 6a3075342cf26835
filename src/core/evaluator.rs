//! Per-click allow/block decision.
//!
//! An event walks `Received -> WhitelistCheck -> BlocklistCheck -> ThresholdCheck`
//! and ends in `Decided`. Whitelist matches end the walk immediately without
//! touching the blocklist; blocklist and exclusion matches end it before any click
//! is counted; otherwise every threshold rule is evaluated against the click
//! history of this ip and tenant.
//!
//! Expiry and windows are measured against the receipt time supplied by the
//! caller. The timestamp a client reports on the event is never used here.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::blocklist::{BlocklistStore, Denial};
use super::event::{ClickEvent, FraudSource};
use super::rule_store::{TenantRules, ThresholdRule};
use crate::store::KvStore;
use crate::utils::{log_decision, log_store_failure, EngineError, EngineResult, StoreContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DecisionReason {
    Whitelisted { pattern: String },
    Blocklisted { rule_id: String },
    ManualExclusion { pattern: String },
    ThresholdBreach { rule_id: String },
    WithinLimits,
    /// Whitelist or blocklist status could not be confirmed
    StoreUnavailable,
}

impl DecisionReason {
    pub fn label(&self) -> &'static str {
        match self {
            DecisionReason::Whitelisted { .. } => "whitelisted",
            DecisionReason::Blocklisted { .. } => "blocklisted",
            DecisionReason::ManualExclusion { .. } => "manual_exclusion",
            DecisionReason::ThresholdBreach { .. } => "threshold_breach",
            DecisionReason::WithinLimits => "within_limits",
            DecisionReason::StoreUnavailable => "store_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: DecisionReason,
    /// Every rule breached by this click, in rule-set order
    pub breached_rules: Vec<String>,
}

impl Decision {
    fn allow(reason: DecisionReason) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason,
            breached_rules: Vec::new(),
        }
    }

    fn block(reason: DecisionReason) -> Self {
        Self {
            verdict: Verdict::Block,
            reason,
            breached_rules: Vec::new(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.verdict == Verdict::Block
    }

    /// Fraud bucket for the rollup; external signals win, rule breaches count as
    /// suspicious patterns, anything else stays unclassified
    pub fn fraud_category(&self, signal: Option<FraudSource>) -> Option<FraudSource> {
        if !self.is_blocked() {
            return None;
        }
        signal.or(match self.reason {
            DecisionReason::ThresholdBreach { .. } => Some(FraudSource::SuspiciousPatterns),
            _ => None,
        })
    }
}

#[derive(Debug)]
enum State {
    Received,
    WhitelistCheck,
    BlocklistCheck,
    ThresholdCheck,
    Decided(Decision),
}

/// Pick the rule recorded as the block reason: the smallest window wins,
/// ties go to the earlier rule
pub fn fastest_trigger<'a>(breached: &[&'a ThresholdRule]) -> Option<&'a ThresholdRule> {
    breached
        .iter()
        .copied()
        .min_by_key(|rule| rule.window_duration.as_seconds())
}

#[derive(Clone)]
pub struct RuleEvaluator {
    store: Arc<dyn KvStore>,
    blocklist: BlocklistStore,
}

impl RuleEvaluator {
    pub fn new(store: Arc<dyn KvStore>, blocklist: BlocklistStore) -> Self {
        Self { store, blocklist }
    }

    pub fn history_key(tenant: &str, ip: &IpAddr) -> String {
        format!("clicks:{}:{}", tenant, ip)
    }

    /// Evaluate and fail closed: a store failure blocks the click
    pub async fn decide(&self, event: &ClickEvent, rules: &TenantRules, now: DateTime<Utc>) -> Decision {
        let decision = match self.evaluate(event, rules, now).await {
            Ok(decision) => decision,
            Err(err) => {
                if let EngineError::Store { operation, .. } = &err {
                    metrics::increment_counter!("store_failures_total", "operation" => *operation);
                }
                log_store_failure(&event.website_id, "evaluate", &err);
                Decision::block(DecisionReason::StoreUnavailable)
            }
        };

        metrics::increment_counter!(
            "click_decisions_total",
            "decision" => if decision.is_blocked() { "block" } else { "allow" },
            "reason" => decision.reason.label()
        );
        log_decision(
            &event.website_id,
            &event.ip.to_string(),
            decision.is_blocked(),
            decision.reason.label(),
        );
        decision
    }

    /// Run the decision state machine at server time `now`; store errors are
    /// returned to the caller
    pub async fn evaluate(
        &self,
        event: &ClickEvent,
        rules: &TenantRules,
        now: DateTime<Utc>,
    ) -> EngineResult<Decision> {
        let tenant = event.website_id.as_str();
        let mut state = State::Received;

        loop {
            state = match state {
                State::Received => State::WhitelistCheck,
                State::WhitelistCheck => match rules.whitelisted_by(&event.ip) {
                    Some(entry) => State::Decided(Decision::allow(DecisionReason::Whitelisted {
                        pattern: entry.ip.to_string(),
                    })),
                    None => State::BlocklistCheck,
                },
                State::BlocklistCheck => match self.blocklist.denial(tenant, &event.ip, rules, now).await? {
                    Some(Denial::Blocked(entry)) => {
                        State::Decided(Decision::block(DecisionReason::Blocklisted { rule_id: entry.reason }))
                    }
                    Some(Denial::Excluded(pattern)) => State::Decided(Decision::block(
                        DecisionReason::ManualExclusion {
                            pattern: pattern.to_string(),
                        },
                    )),
                    None => State::ThresholdCheck,
                },
                State::ThresholdCheck => State::Decided(self.check_thresholds(event, rules, now).await?),
                State::Decided(decision) => return Ok(decision),
            };
        }
    }

    async fn check_thresholds(
        &self,
        event: &ClickEvent,
        rules: &TenantRules,
        now: DateTime<Utc>,
    ) -> EngineResult<Decision> {
        let Some(longest) = rules.longest_window() else {
            return Ok(Decision::allow(DecisionReason::WithinLimits));
        };
        let tenant = event.website_id.as_str();
        let key = Self::history_key(tenant, &event.ip);
        let now_ms = now.timestamp_millis();

        self.store
            .record_click(&key, &event.id.to_string(), now_ms)
            .await
            .in_tenant(tenant, "record_click")?;

        // Every rule is counted; no short circuit on the first breach
        let mut breached = Vec::new();
        for rule in &rules.rules {
            let from = now_ms - rule.window_duration.as_seconds() * 1000;
            let count = self
                .store
                .count_clicks(&key, from, now_ms)
                .await
                .in_tenant(tenant, "count_clicks")?;
            if count > u64::from(rule.max_count) {
                breached.push(rule);
            }
        }

        self.store
            .prune_clicks(&key, now_ms - longest.as_seconds() * 1000)
            .await
            .in_tenant(tenant, "prune_clicks")?;

        let Some(trigger) = fastest_trigger(&breached) else {
            return Ok(Decision::allow(DecisionReason::WithinLimits));
        };

        self.blocklist
            .block(tenant, &event.ip, &trigger.id, rules.block_period_days, now)
            .await?;

        Ok(Decision {
            verdict: Verdict::Block,
            reason: DecisionReason::ThresholdBreach {
                rule_id: trigger.id.clone(),
            },
            breached_rules: breached.iter().map(|rule| rule.id.clone()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantDefaults;
    use crate::core::rule_store::WindowDuration;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn evaluator() -> RuleEvaluator {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        RuleEvaluator::new(Arc::clone(&store), BlocklistStore::new(store))
    }

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn fastest_trigger_prefers_smallest_window() {
        let daily = ThresholdRule::new("daily", 50, WindowDuration::days(1));
        let burst = ThresholdRule::new("burst", 3, WindowDuration::minutes(10));
        let burst_twin = ThresholdRule::new("burst-twin", 5, WindowDuration::minutes(10));

        let picked = fastest_trigger(&[&daily, &burst, &burst_twin]).unwrap();
        assert_eq!(picked.id, "burst");
        assert!(fastest_trigger(&[]).is_none());
    }

    #[tokio::test]
    async fn claimed_timestamps_do_not_spread_the_window() {
        let evaluator = evaluator();
        let mut rules = TenantRules::new(TenantDefaults::default());
        rules
            .add_rule(ThresholdRule::new("burst", 2, WindowDuration::minutes(10)))
            .unwrap();
        let ip: IpAddr = "203.0.113.30".parse().unwrap();

        let mut verdicts = Vec::new();
        for days_back in [0, 3, 6] {
            let event = ClickEvent::new("w1", ip, received_at() - Duration::days(days_back), "curl/8.0");
            verdicts.push(evaluator.evaluate(&event, &rules, received_at()).await.unwrap().verdict);
        }
        assert_eq!(verdicts, vec![Verdict::Allow, Verdict::Allow, Verdict::Block]);
    }

    #[tokio::test]
    async fn future_dated_event_sees_live_block() {
        let evaluator = evaluator();
        let rules = TenantRules::new(TenantDefaults::default());
        let ip: IpAddr = "192.0.2.77".parse().unwrap();
        evaluator
            .blocklist
            .block("w1", &ip, "burst", 7, received_at())
            .await
            .unwrap();

        let forged = ClickEvent::new("w1", ip, received_at() + Duration::days(30), "curl/8.0");
        let decision = evaluator.evaluate(&forged, &rules, received_at()).await.unwrap();

        assert_eq!(
            decision.reason,
            DecisionReason::Blocklisted {
                rule_id: "burst".to_string()
            }
        );
        assert_eq!(evaluator.blocklist.list("w1", received_at()).await.unwrap().len(), 1);
    }

    #[test]
    fn fraud_category_prefers_external_signal() {
        let breach = Decision {
            verdict: Verdict::Block,
            reason: DecisionReason::ThresholdBreach {
                rule_id: "r".to_string(),
            },
            breached_rules: vec!["r".to_string()],
        };
        assert_eq!(breach.fraud_category(None), Some(FraudSource::SuspiciousPatterns));
        assert_eq!(
            breach.fraud_category(Some(FraudSource::VpnTraffic)),
            Some(FraudSource::VpnTraffic)
        );

        let excluded = Decision::block(DecisionReason::ManualExclusion {
            pattern: "9.9.9.9".to_string(),
        });
        assert_eq!(excluded.fraud_category(None), None);

        let allowed = Decision::allow(DecisionReason::WithinLimits);
        assert_eq!(allowed.fraud_category(Some(FraudSource::BotNetworks)), None);
    }
}
