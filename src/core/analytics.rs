//! Per-website rollup counters.
//!
//! A rollup is a single counter hash at `analytics:{website}`. Recording an event
//! computes all of its deltas up front and applies them in one atomic batch, so a
//! click is either fully counted or not counted at all.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use super::evaluator::Verdict;
use super::event::{BrowserFamily, ClickEvent, DeviceType, FraudSource};
use crate::store::KvStore;
use crate::utils::{log_store_failure, EngineResult, StoreContext};

pub const KEY_PREFIX: &str = "analytics:";

const TOTAL_CLICKS: &str = "total_clicks";
const FRAUDULENT_CLICKS: &str = "fraudulent_clicks";
const UNCLASSIFIED: &str = "unclassified";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudSources {
    pub bot_networks: u64,
    pub vpn_traffic: u64,
    pub datacenter_ips: u64,
    pub suspicious_patterns: u64,
    /// Blocks that arrived without a category
    pub unclassified: u64,
}

impl FraudSources {
    pub fn total(&self) -> u64 {
        self.bot_networks + self.vpn_traffic + self.datacenter_ips + self.suspicious_patterns + self.unclassified
    }

    fn slot(&mut self, name: &str) -> Option<&mut u64> {
        match name {
            "bot_networks" => Some(&mut self.bot_networks),
            "vpn_traffic" => Some(&mut self.vpn_traffic),
            "datacenter_ips" => Some(&mut self.datacenter_ips),
            "suspicious_patterns" => Some(&mut self.suspicious_patterns),
            UNCLASSIFIED => Some(&mut self.unclassified),
            _ => None,
        }
    }

    fn merge(&mut self, other: &FraudSources) {
        self.bot_networks += other.bot_networks;
        self.vpn_traffic += other.vpn_traffic;
        self.datacenter_ips += other.datacenter_ips;
        self.suspicious_patterns += other.suspicious_patterns;
        self.unclassified += other.unclassified;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeoCounter {
    pub clicks: u64,
    pub fraud: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCounts {
    pub desktop: u64,
    pub mobile: u64,
    pub tablet: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrowserCounts {
    pub chrome: u64,
    pub safari: u64,
    pub firefox: u64,
    pub edge: u64,
    pub other: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRollup {
    pub website_id: String,
    pub total_clicks: u64,
    pub fraudulent_clicks: u64,
    pub clicks_by_date: BTreeMap<String, u64>,
    pub fraud_by_date: BTreeMap<String, u64>,
    pub fraud_sources: FraudSources,
    pub geographic: BTreeMap<String, GeoCounter>,
    pub devices: DeviceCounts,
    pub browsers: BrowserCounts,
}

impl AnalyticsRollup {
    pub fn empty(website_id: impl Into<String>) -> Self {
        Self {
            website_id: website_id.into(),
            ..Self::default()
        }
    }

    /// Rebuild a rollup from its counter hash; unknown fields are ignored
    pub fn from_counters(website_id: impl Into<String>, counters: &HashMap<String, i64>) -> Self {
        let mut rollup = Self::empty(website_id);
        for (field, value) in counters {
            let value = u64::try_from(*value).unwrap_or(0);
            let mut parts = field.splitn(2, ':');
            match (parts.next(), parts.next()) {
                (Some(TOTAL_CLICKS), None) => rollup.total_clicks = value,
                (Some(FRAUDULENT_CLICKS), None) => rollup.fraudulent_clicks = value,
                (Some("date"), Some(rest)) => {
                    if let Some((date, side)) = rest.rsplit_once(':') {
                        let target = match side {
                            "clicks" => &mut rollup.clicks_by_date,
                            _ => &mut rollup.fraud_by_date,
                        };
                        target.insert(date.to_string(), value);
                    }
                }
                (Some("geo"), Some(rest)) => {
                    if let Some((country, side)) = rest.rsplit_once(':') {
                        let counter = rollup.geographic.entry(country.to_string()).or_default();
                        match side {
                            "clicks" => counter.clicks = value,
                            _ => counter.fraud = value,
                        }
                    }
                }
                (Some("source"), Some(name)) => {
                    if let Some(slot) = rollup.fraud_sources.slot(name) {
                        *slot = value;
                    }
                }
                (Some("device"), Some(name)) => match name {
                    "desktop" => rollup.devices.desktop = value,
                    "mobile" => rollup.devices.mobile = value,
                    "tablet" => rollup.devices.tablet = value,
                    _ => {}
                },
                (Some("browser"), Some(name)) => match name {
                    "chrome" => rollup.browsers.chrome = value,
                    "safari" => rollup.browsers.safari = value,
                    "firefox" => rollup.browsers.firefox = value,
                    "edge" => rollup.browsers.edge = value,
                    "other" => rollup.browsers.other = value,
                    _ => {}
                },
                _ => {}
            }
        }
        rollup
    }

    /// Invariant violations; empty when the rollup is consistent
    pub fn violations(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.fraudulent_clicks > self.total_clicks {
            problems.push(format!(
                "fraudulentClicks ({}) exceeds totalClicks ({})",
                self.fraudulent_clicks, self.total_clicks
            ));
        }
        let sources = self.fraud_sources.total();
        if sources != self.fraudulent_clicks {
            problems.push(format!(
                "fraudSources sum ({}) differs from fraudulentClicks ({})",
                sources, self.fraudulent_clicks
            ));
        }
        let by_date: u64 = self.clicks_by_date.values().sum();
        if by_date != self.total_clicks {
            problems.push(format!(
                "clicksByDate sum ({}) differs from totalClicks ({})",
                by_date, self.total_clicks
            ));
        }
        let fraud_by_date: u64 = self.fraud_by_date.values().sum();
        if fraud_by_date != self.fraudulent_clicks {
            problems.push(format!(
                "fraudByDate sum ({}) differs from fraudulentClicks ({})",
                fraud_by_date, self.fraudulent_clicks
            ));
        }
        for (country, counter) in &self.geographic {
            if counter.fraud > counter.clicks {
                problems.push(format!(
                    "geographic[{}] fraud ({}) exceeds clicks ({})",
                    country, counter.fraud, counter.clicks
                ));
            }
        }
        problems
    }

    fn merge(&mut self, other: &AnalyticsRollup) {
        self.total_clicks += other.total_clicks;
        self.fraudulent_clicks += other.fraudulent_clicks;
        for (date, n) in &other.clicks_by_date {
            *self.clicks_by_date.entry(date.clone()).or_insert(0) += n;
        }
        for (date, n) in &other.fraud_by_date {
            *self.fraud_by_date.entry(date.clone()).or_insert(0) += n;
        }
        self.fraud_sources.merge(&other.fraud_sources);
        for (country, counter) in &other.geographic {
            let entry = self.geographic.entry(country.clone()).or_default();
            entry.clicks += counter.clicks;
            entry.fraud += counter.fraud;
        }
        self.devices.desktop += other.devices.desktop;
        self.devices.mobile += other.devices.mobile;
        self.devices.tablet += other.devices.tablet;
        self.browsers.chrome += other.browsers.chrome;
        self.browsers.safari += other.browsers.safari;
        self.browsers.firefox += other.browsers.firefox;
        self.browsers.edge += other.browsers.edge;
        self.browsers.other += other.browsers.other;
    }
}

/// All counter deltas one event contributes
pub fn event_deltas(event: &ClickEvent, verdict: Verdict, category: Option<FraudSource>) -> Vec<(String, i64)> {
    let date = event.date_key();
    let country = event.geo.country_key();

    let mut deltas = vec![
        (TOTAL_CLICKS.to_string(), 1),
        (format!("date:{}:clicks", date), 1),
        (format!("geo:{}:clicks", country), 1),
        (device_field(event.device.device_type), 1),
        (browser_field(event.device.browser), 1),
    ];

    if verdict == Verdict::Block {
        let source = category.map_or(UNCLASSIFIED, FraudSource::as_str);
        deltas.extend([
            (FRAUDULENT_CLICKS.to_string(), 1),
            (format!("date:{}:fraud", date), 1),
            (format!("geo:{}:fraud", country), 1),
            (format!("source:{}", source), 1),
        ]);
    }
    deltas
}

fn device_field(device: DeviceType) -> String {
    format!("device:{}", device.as_str())
}

fn browser_field(browser: BrowserFamily) -> String {
    format!("browser:{}", browser.as_str())
}

/// Rollup read result; reads fail open with a zero snapshot and a warning
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsView {
    pub rollup: AnalyticsRollup,
    pub warning: Option<String>,
}

/// Totals across all websites
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub websites: usize,
    pub total_clicks: u64,
    pub fraudulent_clicks: u64,
    /// Percentage of clicks blocked, 0 when there is no traffic
    pub fraud_rate: f64,
    pub fraud_sources: FraudSources,
    pub top_countries: Vec<(String, GeoCounter)>,
    pub warning: Option<String>,
}

#[derive(Clone)]
pub struct AnalyticsAggregator {
    store: Arc<dyn KvStore>,
}

impl AnalyticsAggregator {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn key(website_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, website_id)
    }

    /// Create the zero-valued rollup of a newly registered website
    pub async fn initialize(&self, website_id: &str) -> EngineResult<()> {
        let zero = [(TOTAL_CLICKS.to_string(), 0), (FRAUDULENT_CLICKS.to_string(), 0)];
        self.store
            .incr_counters(&Self::key(website_id), &zero)
            .await
            .in_tenant(website_id, "analytics_init")
    }

    /// Count one evaluated click, all counters in one atomic step
    pub async fn record(
        &self,
        event: &ClickEvent,
        verdict: Verdict,
        category: Option<FraudSource>,
    ) -> EngineResult<()> {
        let deltas = event_deltas(event, verdict, category);
        self.store
            .incr_counters(&Self::key(&event.website_id), &deltas)
            .await
            .in_tenant(&event.website_id, "analytics_record")
    }

    /// Current rollup, `None` when the website has none
    pub async fn snapshot(&self, website_id: &str) -> EngineResult<Option<AnalyticsRollup>> {
        let counters = self
            .store
            .counters(&Self::key(website_id))
            .await
            .in_tenant(website_id, "analytics_read")?;
        if counters.is_empty() {
            return Ok(None);
        }
        Ok(Some(AnalyticsRollup::from_counters(website_id, &counters)))
    }

    /// Reporting read: store failures degrade to an empty rollup plus warning
    pub async fn view(&self, website_id: &str) -> AnalyticsView {
        match self.snapshot(website_id).await {
            Ok(rollup) => AnalyticsView {
                rollup: rollup.unwrap_or_else(|| AnalyticsRollup::empty(website_id)),
                warning: None,
            },
            Err(err) => {
                log_store_failure(website_id, "analytics_read", &err);
                AnalyticsView {
                    rollup: AnalyticsRollup::empty(website_id),
                    warning: Some(format!("analytics unavailable: {}", err)),
                }
            }
        }
    }

    /// Website ids that own a rollup
    pub async fn rollup_ids(&self) -> EngineResult<Vec<String>> {
        let keys = self
            .store
            .keys_with_prefix(KEY_PREFIX)
            .await
            .in_tenant("*", "analytics_list")?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect())
    }

    /// Views for every website in `website_ids`, read concurrently
    pub async fn views(&self, website_ids: &[String]) -> Vec<AnalyticsView> {
        futures::future::join_all(website_ids.iter().map(|id| self.view(id))).await
    }

    /// Cross-website totals for the overview page
    pub async fn overview(&self, website_ids: &[String]) -> Overview {
        let views = self.views(website_ids).await;
        let mut combined = AnalyticsRollup::empty("*");
        let mut warnings = Vec::new();
        for view in &views {
            combined.merge(&view.rollup);
            if let Some(warning) = &view.warning {
                warnings.push(format!("{}: {}", view.rollup.website_id, warning));
            }
        }

        let mut top_countries: Vec<(String, GeoCounter)> = combined.geographic.into_iter().collect();
        top_countries.sort_by(|a, b| b.1.clicks.cmp(&a.1.clicks).then_with(|| a.0.cmp(&b.0)));
        top_countries.truncate(10);

        let fraud_rate = if combined.total_clicks == 0 {
            0.0
        } else {
            combined.fraudulent_clicks as f64 * 100.0 / combined.total_clicks as f64
        };

        Overview {
            websites: website_ids.len(),
            total_clicks: combined.total_clicks,
            fraudulent_clicks: combined.fraudulent_clicks,
            fraud_rate,
            fraud_sources: combined.fraud_sources,
            top_countries,
            warning: if warnings.is_empty() {
                None
            } else {
                Some(warnings.join("; "))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{DeviceInfo, GeoInfo};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn event(country: &str) -> ClickEvent {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();
        ClickEvent::new("w1", "203.0.113.5".parse().unwrap(), at, "curl/8")
            .with_geo(GeoInfo {
                country: country.to_string(),
                region: None,
                city: None,
            })
            .with_device(DeviceInfo {
                device_type: DeviceType::Mobile,
                os: None,
                browser: BrowserFamily::Safari,
            })
    }

    #[test]
    fn allowed_click_touches_only_click_side() {
        let deltas = event_deltas(&event("us"), Verdict::Allow, Some(FraudSource::BotNetworks));
        let fields: Vec<&str> = deltas.iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "total_clicks",
                "date:2024-05-17:clicks",
                "geo:US:clicks",
                "device:mobile",
                "browser:safari"
            ]
        );
    }

    #[test]
    fn blocked_click_adds_fraud_side() {
        let deltas = event_deltas(&event("DE"), Verdict::Block, Some(FraudSource::DatacenterIps));
        let fields: Vec<&str> = deltas.iter().map(|(f, _)| f.as_str()).collect();
        assert!(fields.contains(&"fraudulent_clicks"));
        assert!(fields.contains(&"date:2024-05-17:fraud"));
        assert!(fields.contains(&"geo:DE:fraud"));
        assert!(fields.contains(&"geo:DE:clicks"));
        assert!(fields.contains(&"source:datacenter_ips"));
    }

    #[tokio::test]
    async fn rollup_round_trips_through_counters() {
        let aggregator = AnalyticsAggregator::new(Arc::new(MemoryStore::new()));
        aggregator.initialize("w1").await.unwrap();
        aggregator.record(&event("US"), Verdict::Allow, None).await.unwrap();
        aggregator
            .record(&event("US"), Verdict::Block, Some(FraudSource::VpnTraffic))
            .await
            .unwrap();
        aggregator.record(&event("FR"), Verdict::Block, None).await.unwrap();

        let rollup = aggregator.snapshot("w1").await.unwrap().unwrap();
        assert_eq!(rollup.total_clicks, 3);
        assert_eq!(rollup.fraudulent_clicks, 2);
        assert_eq!(rollup.clicks_by_date["2024-05-17"], 3);
        assert_eq!(rollup.fraud_by_date["2024-05-17"], 2);
        assert_eq!(rollup.fraud_sources.vpn_traffic, 1);
        assert_eq!(rollup.fraud_sources.unclassified, 1);
        assert_eq!(rollup.geographic["US"], GeoCounter { clicks: 2, fraud: 1 });
        assert_eq!(rollup.geographic["FR"], GeoCounter { clicks: 1, fraud: 1 });
        assert_eq!(rollup.devices.mobile, 3);
        assert_eq!(rollup.browsers.safari, 3);
        assert!(rollup.violations().is_empty());
    }

    #[tokio::test]
    async fn missing_rollup_reads_as_none() {
        let aggregator = AnalyticsAggregator::new(Arc::new(MemoryStore::new()));
        assert!(aggregator.snapshot("ghost").await.unwrap().is_none());
        let view = aggregator.view("ghost").await;
        assert_eq!(view.rollup.total_clicks, 0);
        assert!(view.warning.is_none());
    }

    #[test]
    fn violations_detect_drift() {
        let mut rollup = AnalyticsRollup::empty("w1");
        rollup.total_clicks = 1;
        rollup.fraudulent_clicks = 2;
        rollup.clicks_by_date.insert("2024-01-01".to_string(), 1);
        let problems = rollup.violations();
        assert!(problems.iter().any(|p| p.contains("exceeds totalClicks")));
        assert!(problems.iter().any(|p| p.contains("fraudSources sum")));
        assert!(problems.iter().any(|p| p.contains("fraudByDate sum")));
    }
}
