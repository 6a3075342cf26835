use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::TenantDefaults;
use crate::core::{
    AnalyticsAggregator, BlocklistStore, ClickEvent, Decision, DecisionReason, DeviceInfo,
    DiagnosticsSweep, FraudSource, GeoInfo, RuleEvaluator, RuleStore, TenantRules, Verdict,
    WebsiteRegistry,
};
use crate::store::KvStore;
use crate::utils::{
    create_request_span, log_service_event, log_store_failure, EngineError, EngineResult,
    ValidationError,
};

/// Click as reported by the tracking snippet
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickSubmission {
    pub snippet_id: String,
    pub ip: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub referrer: Option<String>,
    /// Client-reported time; only dates the analytics bucket, and is clamped
    /// to the time of receipt
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub geo: Option<GeoInfo>,
    #[serde(default)]
    pub device: Option<DeviceInfo>,
    #[serde(default)]
    pub fraud_source: Option<FraudSource>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackOutcome {
    pub decision: Verdict,
    pub reason: DecisionReason,
    pub breached_rules: Vec<String>,
    pub website_id: Option<String>,
    /// False when the analytics update could not be applied
    pub recorded: bool,
}

impl TrackOutcome {
    fn fail_closed(website_id: Option<String>) -> Self {
        Self {
            decision: Verdict::Block,
            reason: DecisionReason::StoreUnavailable,
            breached_rules: Vec::new(),
            website_id,
            recorded: false,
        }
    }
}

/// Click fraud service wiring the decision engine together
///
/// Each click flows one way: evaluator (reads rules, reads/writes the blocklist)
/// then the analytics aggregator.
pub struct ClickFraudService {
    store: Arc<dyn KvStore>,
    websites: WebsiteRegistry,
    rules: RuleStore,
    blocklist: BlocklistStore,
    evaluator: RuleEvaluator,
    analytics: AnalyticsAggregator,
    diagnostics: DiagnosticsSweep,
}

impl ClickFraudService {
    /// Creates the service over a store; wrap it in `TimedStore` to bound lookups
    pub fn new(store: Arc<dyn KvStore>, defaults: TenantDefaults) -> Self {
        let rules = RuleStore::new(Arc::clone(&store), defaults);
        let blocklist = BlocklistStore::new(Arc::clone(&store));
        let analytics = AnalyticsAggregator::new(Arc::clone(&store));
        let evaluator = RuleEvaluator::new(Arc::clone(&store), blocklist.clone());
        let websites = WebsiteRegistry::new(Arc::clone(&store), rules.clone(), analytics.clone());
        let diagnostics = DiagnosticsSweep::new(Arc::clone(&store), websites.clone(), analytics.clone());

        Self {
            store,
            websites,
            rules,
            blocklist,
            evaluator,
            analytics,
            diagnostics,
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn websites(&self) -> &WebsiteRegistry {
        &self.websites
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn blocklist(&self) -> &BlocklistStore {
        &self.blocklist
    }

    pub fn analytics(&self) -> &AnalyticsAggregator {
        &self.analytics
    }

    pub fn diagnostics(&self) -> &DiagnosticsSweep {
        &self.diagnostics
    }

    /// Ingest one click: resolve the tenant, decide, then count it
    ///
    /// Unknown snippets and malformed addresses are errors. Store failures on
    /// the decision path never surface as errors; they block the click.
    pub async fn track_click(&self, submission: ClickSubmission) -> EngineResult<TrackOutcome> {
        self.track_click_at(submission, Utc::now()).await
    }

    /// Ingest a click received at `received_at`, the clock every decision uses
    pub async fn track_click_at(
        &self,
        submission: ClickSubmission,
        received_at: DateTime<Utc>,
    ) -> EngineResult<TrackOutcome> {
        let ip: IpAddr = submission
            .ip
            .trim()
            .parse()
            .map_err(|_| ValidationError::InvalidPattern(submission.ip.clone()))?;

        let website_id = match self.websites.resolve_snippet(&submission.snippet_id).await {
            Ok(id) => id,
            Err(EngineError::NotFound { kind, id }) => return Err(EngineError::NotFound { kind, id }),
            Err(err) => {
                log_store_failure(&submission.snippet_id, "resolve_snippet", &err);
                metrics::increment_counter!("click_decisions_total", "decision" => "block", "reason" => "store_unavailable");
                return Ok(TrackOutcome::fail_closed(None));
            }
        };

        let mut event = ClickEvent::new(
            website_id.clone(),
            ip,
            reported_time(submission.timestamp, received_at),
            submission.user_agent,
        )
        .with_referrer(submission.referrer)
        .with_fraud_source(submission.fraud_source);
        if let Some(geo) = submission.geo {
            event = event.with_geo(geo);
        }
        if let Some(device) = submission.device {
            event = event.with_device(device);
        }

        let span = create_request_span(&event.id.to_string(), &website_id);
        self.process(event, received_at).instrument(span).await
    }

    /// Decide and record an already built event at server time `now`
    pub async fn process(&self, event: ClickEvent, now: DateTime<Utc>) -> EngineResult<TrackOutcome> {
        let decision = match self.rules.get(&event.website_id).await {
            Ok(rules) => self.evaluator.decide(&event, &rules, now).await,
            Err(EngineError::NotFound { .. }) => {
                tracing::warn!(tenant = %event.website_id, "no stored rules, evaluating with defaults");
                let defaults = TenantRules::new(self.rules.defaults());
                self.evaluator.decide(&event, &defaults, now).await
            }
            Err(err) => {
                log_store_failure(&event.website_id, "load_rules", &err);
                metrics::increment_counter!("click_decisions_total", "decision" => "block", "reason" => "store_unavailable");
                Decision {
                    verdict: Verdict::Block,
                    reason: DecisionReason::StoreUnavailable,
                    breached_rules: Vec::new(),
                }
            }
        };

        let category = decision.fraud_category(event.fraud_source);
        let recorded = match self.analytics.record(&event, decision.verdict, category).await {
            Ok(()) => true,
            Err(err) => {
                metrics::increment_counter!("analytics_record_failures_total");
                log_store_failure(&event.website_id, "analytics_record", &err);
                false
            }
        };

        Ok(TrackOutcome {
            decision: decision.verdict,
            reason: decision.reason,
            breached_rules: decision.breached_rules,
            website_id: Some(event.website_id),
            recorded,
        })
    }

    /// Periodic eviction of expired blocklist entries
    pub async fn sweep_expired_blocks(&self) -> EngineResult<usize> {
        self.blocklist.evict(Utc::now()).await
    }

    /// Run the eviction sweep every `interval` until the task is aborted
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_expired_blocks().await {
                    log_service_event("blocklist_sweep", false, Some(&err.to_string()));
                }
            }
        })
    }
}

/// Event time for date buckets; a missing or future-dated report becomes the
/// time of receipt
fn reported_time(reported: Option<DateTime<Utc>>, received_at: DateTime<Utc>) -> DateTime<Utc> {
    match reported {
        Some(at) if at <= received_at => at,
        Some(at) => {
            tracing::debug!(reported = %at, received = %received_at, "future click timestamp clamped");
            received_at
        }
        None => received_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockKvStore, StoredBlock};
    use crate::utils::StoreError;
    use chrono::TimeZone;

    fn submission(ip: &str) -> ClickSubmission {
        ClickSubmission {
            snippet_id: "snip".to_string(),
            ip: ip.to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            referrer: None,
            timestamp: None,
            geo: None,
            device: None,
            fraud_source: None,
        }
    }

    fn rules_json() -> String {
        serde_json::to_string(&TenantRules::new(TenantDefaults::default())).unwrap()
    }

    #[tokio::test]
    async fn unreachable_store_blocks_ingest() {
        let mut store = MockKvStore::new();
        store
            .expect_get()
            .returning(|_| Err(StoreError::Unavailable("connection refused".to_string())));

        let service = ClickFraudService::new(Arc::new(store), TenantDefaults::default());
        let outcome = service.track_click(submission("8.8.8.8")).await.unwrap();

        assert_eq!(outcome.decision, Verdict::Block);
        assert_eq!(outcome.reason, DecisionReason::StoreUnavailable);
        assert!(!outcome.recorded);
    }

    #[tokio::test]
    async fn failed_blocklist_lookup_blocks_and_is_counted() {
        let mut store = MockKvStore::new();
        store.expect_get().returning(|key| match key {
            "snippet:snip" => Ok(Some("w1".to_string())),
            "rules:w1" => Ok(Some(rules_json())),
            _ => Ok(None),
        });
        store
            .expect_get_block()
            .returning(|_| Err(StoreError::Timeout { operation: "get_block", timeout_ms: 250 }));
        store
            .expect_incr_counters()
            .withf(|key, deltas| key.to_string() == "analytics:w1" && deltas.iter().any(|(f, _)| f == "source:unclassified"))
            .times(1)
            .returning(|_, _| Ok(()));

        let service = ClickFraudService::new(Arc::new(store), TenantDefaults::default());
        let outcome = service.track_click(submission("8.8.8.8")).await.unwrap();

        assert_eq!(outcome.decision, Verdict::Block);
        assert_eq!(outcome.reason, DecisionReason::StoreUnavailable);
        assert!(outcome.recorded);
    }

    #[tokio::test]
    async fn future_dated_click_cannot_expire_a_live_block() {
        let received_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let expires_at = (received_at + chrono::Duration::days(7)).timestamp_millis();

        let mut store = MockKvStore::new();
        store.expect_get().returning(|key| match key {
            "snippet:snip" => Ok(Some("w1".to_string())),
            "rules:w1" => Ok(Some(rules_json())),
            _ => Ok(None),
        });
        store.expect_get_block().returning(move |_| {
            Ok(Some(StoredBlock {
                ip: "192.0.2.77".to_string(),
                blocked_at: received_at.timestamp_millis(),
                expires_at,
                reason: "burst".to_string(),
            }))
        });
        store.expect_remove_block_if_expired().times(0);
        store
            .expect_incr_counters()
            .withf(|_, deltas| deltas.iter().any(|(f, _)| f == "date:2024-03-01:clicks"))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut forged = submission("192.0.2.77");
        forged.timestamp = Some(received_at + chrono::Duration::days(30));

        let service = ClickFraudService::new(Arc::new(store), TenantDefaults::default());
        let outcome = service.track_click_at(forged, received_at).await.unwrap();

        assert_eq!(outcome.decision, Verdict::Block);
        assert_eq!(
            outcome.reason,
            DecisionReason::Blocklisted {
                rule_id: "burst".to_string()
            }
        );
    }

    #[test]
    fn reported_time_is_clamped_to_receipt() {
        let received_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let earlier = received_at - chrono::Duration::minutes(5);

        assert_eq!(reported_time(Some(earlier), received_at), earlier);
        assert_eq!(reported_time(Some(received_at + chrono::Duration::days(30)), received_at), received_at);
        assert_eq!(reported_time(None, received_at), received_at);
    }

    #[tokio::test]
    async fn analytics_read_fails_open() {
        let mut store = MockKvStore::new();
        store
            .expect_counters()
            .returning(|_| Err(StoreError::Unavailable("down".to_string())));

        let service = ClickFraudService::new(Arc::new(store), TenantDefaults::default());
        let view = service.analytics().view("w1").await;

        assert_eq!(view.rollup.total_clicks, 0);
        assert!(view.warning.is_some());
    }

    #[tokio::test]
    async fn unknown_snippet_is_not_found() {
        let mut store = MockKvStore::new();
        store.expect_get().returning(|_| Ok(None));

        let service = ClickFraudService::new(Arc::new(store), TenantDefaults::default());
        let err = service.track_click(submission("8.8.8.8")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "snippet", .. }));
    }

    #[tokio::test]
    async fn malformed_ip_is_rejected() {
        let service = ClickFraudService::new(Arc::new(MockKvStore::new()), TenantDefaults::default());
        let err = service.track_click(submission("not-an-ip")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
