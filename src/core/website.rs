//! Registered websites (tenants) and their tracking snippets.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::analytics::AnalyticsAggregator;
use super::rule_store::RuleStore;
use crate::store::KvStore;
use crate::utils::{log_service_event, EngineError, EngineResult, StoreContext, ValidationError};

pub const KEY_PREFIX: &str = "website:";
const SNIPPET_PREFIX: &str = "snippet:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Website {
    pub id: String,
    pub name: String,
    pub url: String,
    pub snippet_id: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of parsing a stored URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlCheck {
    /// Parses and is already in normalized form
    Normalized,
    /// Parses, but normalizing would change it
    Denormalized { normalized: String },
    Invalid(String),
}

/// Canonical form: explicit http(s) scheme, lowercase host, no trailing slash
pub fn normalize_url(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidUrl("empty url".to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = Url::parse(&with_scheme).map_err(|e| ValidationError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidUrl(format!("{}: unsupported scheme {}", raw, parsed.scheme())));
    }
    let Some(host) = parsed.host_str() else {
        return Err(ValidationError::InvalidUrl(format!("{}: missing host", raw)));
    };
    if !host.contains('.') && host != "localhost" {
        return Err(ValidationError::InvalidUrl(format!("{}: host {} is not a domain", raw, host)));
    }

    // Url lowercases the host and inserts a root path; drop the trailing slash
    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    Ok(normalized)
}

pub fn check_url(raw: &str) -> UrlCheck {
    match normalize_url(raw) {
        Ok(normalized) if normalized == raw => UrlCheck::Normalized,
        Ok(normalized) => UrlCheck::Denormalized { normalized },
        Err(err) => UrlCheck::Invalid(err.to_string()),
    }
}

/// A URL rewritten by [`WebsiteRegistry::repair_urls`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlRepair {
    pub website_id: String,
    pub before: String,
    pub after: String,
}

#[derive(Clone)]
pub struct WebsiteRegistry {
    store: Arc<dyn KvStore>,
    rules: RuleStore,
    analytics: AnalyticsAggregator,
}

impl WebsiteRegistry {
    pub fn new(store: Arc<dyn KvStore>, rules: RuleStore, analytics: AnalyticsAggregator) -> Self {
        Self {
            store,
            rules,
            analytics,
        }
    }

    pub fn key(website_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, website_id)
    }

    fn snippet_key(snippet_id: &str) -> String {
        format!("{}{}", SNIPPET_PREFIX, snippet_id)
    }

    /// Register a website with default rules and an empty rollup
    pub async fn register(&self, name: &str, url: &str) -> EngineResult<Website> {
        let url = normalize_url(url)?;
        let website = Website {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            url,
            snippet_id: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
        };

        self.rules.initialize(&website.id).await?;
        self.analytics.initialize(&website.id).await?;
        self.save(&website).await?;
        self.store
            .set(&Self::snippet_key(&website.snippet_id), &website.id)
            .await
            .in_tenant(&website.id, "save_snippet")?;

        log_service_event(
            "website_registered",
            true,
            Some(&format!("{} ({})", website.id, website.url)),
        );
        Ok(website)
    }

    pub async fn get(&self, website_id: &str) -> EngineResult<Website> {
        let raw = self
            .store
            .get(&Self::key(website_id))
            .await
            .in_tenant(website_id, "load_website")?
            .ok_or_else(|| EngineError::not_found("website", website_id))?;
        decode(website_id, &raw)
    }

    pub async fn list(&self) -> EngineResult<Vec<Website>> {
        let keys = self
            .store
            .keys_with_prefix(KEY_PREFIX)
            .await
            .in_tenant("*", "list_websites")?;
        let mut websites = Vec::with_capacity(keys.len());
        for key in keys {
            let id = key.trim_start_matches(KEY_PREFIX);
            if let Some(raw) = self.store.get(&key).await.in_tenant(id, "load_website")? {
                websites.push(decode(id, &raw)?);
            }
        }
        Ok(websites)
    }

    pub async fn ids(&self) -> EngineResult<Vec<String>> {
        let keys = self
            .store
            .keys_with_prefix(KEY_PREFIX)
            .await
            .in_tenant("*", "list_websites")?;
        Ok(keys
            .into_iter()
            .map(|key| key.trim_start_matches(KEY_PREFIX).to_string())
            .collect())
    }

    /// Tenant id behind a tracking snippet
    pub async fn resolve_snippet(&self, snippet_id: &str) -> EngineResult<String> {
        self.store
            .get(&Self::snippet_key(snippet_id))
            .await
            .in_tenant(snippet_id, "resolve_snippet")?
            .ok_or_else(|| EngineError::not_found("snippet", snippet_id))
    }

    /// Operator-triggered rewrite of stored URLs into normalized form.
    /// Invalid URLs are left untouched for manual correction.
    pub async fn repair_urls(&self) -> EngineResult<Vec<UrlRepair>> {
        let mut repairs = Vec::new();
        for mut website in self.list().await? {
            if let UrlCheck::Denormalized { normalized } = check_url(&website.url) {
                let before = std::mem::replace(&mut website.url, normalized);
                self.save(&website).await?;
                repairs.push(UrlRepair {
                    website_id: website.id.clone(),
                    before,
                    after: website.url.clone(),
                });
            }
        }
        log_service_event("url_repair", true, Some(&format!("{} urls rewritten", repairs.len())));
        Ok(repairs)
    }

    async fn save(&self, website: &Website) -> EngineResult<()> {
        let raw = serde_json::to_string(website)
            .map_err(|e| EngineError::InconsistentState(format!("website {} cannot be encoded: {}", website.id, e)))?;
        self.store
            .set(&Self::key(&website.id), &raw)
            .await
            .in_tenant(&website.id, "save_website")
    }
}

fn decode(website_id: &str, raw: &str) -> EngineResult<Website> {
    serde_json::from_str(raw)
        .map_err(|e| EngineError::InconsistentState(format!("website {} cannot be decoded: {}", website_id, e)))
}
