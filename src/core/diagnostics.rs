//! Read-only consistency sweep over websites and their rollups.
//!
//! Nothing here writes to the store; URL repair lives on the registry as a
//! separate operator action.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use super::analytics::AnalyticsAggregator;
use super::website::{check_url, UrlCheck, WebsiteRegistry};
use crate::store::KvStore;
use crate::utils::log_service_event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticResult {
    pub category: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website_id: Option<String>,
}

impl DiagnosticResult {
    fn new(category: &str, status: CheckStatus, message: impl Into<String>, website_id: Option<&str>) -> Self {
        Self {
            category: category.to_string(),
            status,
            message: message.into(),
            website_id: website_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub pass: usize,
    pub warning: usize,
    pub error: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    /// Individual checks, ending with the `Overall Summary` entry
    pub results: Vec<DiagnosticResult>,
    pub summary: Summary,
}

pub const OVERALL_SUMMARY: &str = "Overall Summary";

#[derive(Clone)]
pub struct DiagnosticsSweep {
    store: Arc<dyn KvStore>,
    websites: WebsiteRegistry,
    analytics: AnalyticsAggregator,
}

impl DiagnosticsSweep {
    pub fn new(store: Arc<dyn KvStore>, websites: WebsiteRegistry, analytics: AnalyticsAggregator) -> Self {
        Self {
            store,
            websites,
            analytics,
        }
    }

    pub async fn run(&self) -> DiagnosticsReport {
        let mut results = Vec::new();

        match self.store.ping().await {
            Ok(()) => results.push(DiagnosticResult::new("Store", CheckStatus::Pass, "backing store reachable", None)),
            Err(err) => results.push(DiagnosticResult::new(
                "Store",
                CheckStatus::Error,
                format!("backing store unreachable: {}", err),
                None,
            )),
        }

        match self.websites.list().await {
            Ok(websites) => {
                results.push(DiagnosticResult::new(
                    "Websites",
                    CheckStatus::Pass,
                    format!("{} websites registered", websites.len()),
                    None,
                ));
                let mut known = BTreeSet::new();
                for website in &websites {
                    known.insert(website.id.clone());
                    results.push(url_result(&website.id, &website.url));
                    results.extend(self.rollup_results(&website.id).await);
                }
                results.extend(self.orphan_results(&known).await);
            }
            Err(err) => results.push(DiagnosticResult::new(
                "Websites",
                CheckStatus::Error,
                format!("cannot list websites: {}", err),
                None,
            )),
        }

        let summary = summarize(&results);
        let overall = if summary.error > 0 {
            CheckStatus::Error
        } else if summary.warning > 0 {
            CheckStatus::Warning
        } else {
            CheckStatus::Pass
        };
        results.push(DiagnosticResult::new(
            OVERALL_SUMMARY,
            overall,
            format!("{} passed, {} warnings, {} errors", summary.pass, summary.warning, summary.error),
            None,
        ));

        log_service_event(
            "diagnostics",
            summary.error == 0,
            Some(&format!("pass={} warning={} error={}", summary.pass, summary.warning, summary.error)),
        );
        DiagnosticsReport { results, summary }
    }

    async fn rollup_results(&self, website_id: &str) -> Vec<DiagnosticResult> {
        let id = Some(website_id);
        match self.analytics.snapshot(website_id).await {
            Ok(None) => vec![DiagnosticResult::new(
                "Analytics",
                CheckStatus::Error,
                "no analytics rollup for website",
                id,
            )],
            Ok(Some(rollup)) => {
                let problems = rollup.violations();
                if problems.is_empty() {
                    vec![DiagnosticResult::new(
                        "Analytics",
                        CheckStatus::Pass,
                        format!("rollup consistent ({} clicks)", rollup.total_clicks),
                        id,
                    )]
                } else {
                    problems
                        .into_iter()
                        .map(|problem| DiagnosticResult::new("Analytics", CheckStatus::Error, problem, id))
                        .collect()
                }
            }
            Err(err) => vec![DiagnosticResult::new(
                "Analytics",
                CheckStatus::Error,
                format!("rollup unreadable: {}", err),
                id,
            )],
        }
    }

    async fn orphan_results(&self, known: &BTreeSet<String>) -> Vec<DiagnosticResult> {
        match self.analytics.rollup_ids().await {
            Ok(ids) => ids
                .iter()
                .filter(|id| !known.contains(*id))
                .map(|id| {
                    DiagnosticResult::new(
                        "Analytics",
                        CheckStatus::Warning,
                        "rollup without a registered website",
                        Some(id),
                    )
                })
                .collect(),
            Err(err) => vec![DiagnosticResult::new(
                "Analytics",
                CheckStatus::Error,
                format!("cannot list rollups: {}", err),
                None,
            )],
        }
    }
}

fn url_result(website_id: &str, url: &str) -> DiagnosticResult {
    let id = Some(website_id);
    match check_url(url) {
        UrlCheck::Normalized => DiagnosticResult::new("URL", CheckStatus::Pass, format!("{} is valid", url), id),
        UrlCheck::Denormalized { normalized } => DiagnosticResult::new(
            "URL",
            CheckStatus::Warning,
            format!("{} is not normalized, expected {}", url, normalized),
            id,
        ),
        UrlCheck::Invalid(reason) => DiagnosticResult::new("URL", CheckStatus::Error, reason, id),
    }
}

fn summarize(results: &[DiagnosticResult]) -> Summary {
    results.iter().fold(Summary::default(), |mut summary, result| {
        match result.status {
            CheckStatus::Pass => summary.pass += 1,
            CheckStatus::Warning => summary.warning += 1,
            CheckStatus::Error => summary.error += 1,
        }
        summary
    })
}
