use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Country bucket used when the edge supplied no geography
pub const UNKNOWN_COUNTRY: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

impl GeoInfo {
    pub fn unknown() -> Self {
        Self {
            country: UNKNOWN_COUNTRY.to_string(),
            region: None,
            city: None,
        }
    }

    /// Country key used for rollup buckets
    pub fn country_key(&self) -> String {
        let country = self.country.trim();
        if country.is_empty() {
            UNKNOWN_COUNTRY.to_string()
        } else if country.len() == 2 {
            country.to_ascii_uppercase()
        } else {
            country.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
        }
    }

    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        if ua.contains("ipad") || ua.contains("tablet") || (ua.contains("android") && !ua.contains("mobile")) {
            DeviceType::Tablet
        } else if ua.contains("mobi") || ua.contains("iphone") || ua.contains("android") {
            DeviceType::Mobile
        } else {
            DeviceType::Desktop
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    Chrome,
    Safari,
    Firefox,
    Edge,
    Other,
}

impl BrowserFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            BrowserFamily::Chrome => "chrome",
            BrowserFamily::Safari => "safari",
            BrowserFamily::Firefox => "firefox",
            BrowserFamily::Edge => "edge",
            BrowserFamily::Other => "other",
        }
    }

    /// Order matters: Edge and Opera also advertise Chrome, Chrome advertises Safari
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        if ua.contains("edg/") || ua.contains("edge/") || ua.contains("edga/") || ua.contains("edgios/") {
            BrowserFamily::Edge
        } else if ua.contains("opr/") || ua.contains("opera") || ua.contains("samsungbrowser") {
            BrowserFamily::Other
        } else if ua.contains("firefox/") || ua.contains("fxios/") {
            BrowserFamily::Firefox
        } else if ua.contains("chrome/") || ua.contains("crios/") || ua.contains("chromium/") {
            BrowserFamily::Chrome
        } else if ua.contains("safari/") {
            BrowserFamily::Safari
        } else {
            BrowserFamily::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default)]
    pub os: Option<String>,
    pub browser: BrowserFamily,
}

impl DeviceInfo {
    pub fn from_user_agent(user_agent: &str) -> Self {
        Self {
            device_type: DeviceType::from_user_agent(user_agent),
            os: os_from_user_agent(user_agent),
            browser: BrowserFamily::from_user_agent(user_agent),
        }
    }
}

fn os_from_user_agent(user_agent: &str) -> Option<String> {
    let ua = user_agent.to_ascii_lowercase();
    let os = if ua.contains("windows") {
        "Windows"
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        "iOS"
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        "macOS"
    } else if ua.contains("android") {
        "Android"
    } else if ua.contains("linux") {
        "Linux"
    } else {
        return None;
    };
    Some(os.to_string())
}

/// Fraud category supplied by an external classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FraudSource {
    BotNetworks,
    VpnTraffic,
    DatacenterIps,
    SuspiciousPatterns,
}

impl FraudSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FraudSource::BotNetworks => "bot_networks",
            FraudSource::VpnTraffic => "vpn_traffic",
            FraudSource::DatacenterIps => "datacenter_ips",
            FraudSource::SuspiciousPatterns => "suspicious_patterns",
        }
    }
}

/// One ingested click; immutable once built
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickEvent {
    pub id: Uuid,
    pub website_id: String,
    pub ip: IpAddr,
    pub timestamp: DateTime<Utc>,
    pub user_agent: String,
    pub geo: GeoInfo,
    pub device: DeviceInfo,
    pub referrer: Option<String>,
    /// External fraud signal tag, if the edge classified the click
    pub fraud_source: Option<FraudSource>,
}

impl ClickEvent {
    /// Build an event, deriving device data from the user agent
    pub fn new(website_id: impl Into<String>, ip: IpAddr, timestamp: DateTime<Utc>, user_agent: impl Into<String>) -> Self {
        let user_agent = user_agent.into();
        Self {
            id: Uuid::new_v4(),
            website_id: website_id.into(),
            ip,
            timestamp,
            device: DeviceInfo::from_user_agent(&user_agent),
            user_agent,
            geo: GeoInfo::unknown(),
            referrer: None,
            fraud_source: None,
        }
    }

    pub fn with_geo(mut self, geo: GeoInfo) -> Self {
        self.geo = geo;
        self
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    pub fn with_referrer(mut self, referrer: Option<String>) -> Self {
        self.referrer = referrer;
        self
    }

    pub fn with_fraud_source(mut self, source: Option<FraudSource>) -> Self {
        self.fraud_source = source;
        self
    }

    /// Rollup date bucket (`YYYY-MM-DD`, UTC)
    pub fn date_key(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }
}
