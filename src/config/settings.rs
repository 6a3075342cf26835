use serde::Deserialize;

use crate::core::{BLOCK_PERIOD_RANGE, REFRESH_RATE_RANGE};

/// Configuration settings for the click fraud service
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Backing store selection and timeouts
    pub store: StoreConfig,
    /// Blocklist maintenance
    pub blocklist: BlocklistConfig,
    /// Values a newly registered website starts with
    pub defaults: TenantDefaults,
}

/// Server configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind the server to
    pub host: String,
    /// Port number to listen on
    pub port: u16,
    /// Upper bound for a whole HTTP request
    pub request_timeout_seconds: u64,
}

/// Redis configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Bounded timeout applied to every store call on the decision path
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlocklistConfig {
    /// Interval of the background eviction sweep
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TenantDefaults {
    pub block_period_days: u32,
    pub refresh_rate: u32,
}

impl Default for TenantDefaults {
    fn default() -> Self {
        Self {
            block_period_days: 7,
            refresh_rate: 100,
        }
    }
}

impl Settings {
    /// Load configuration from defaults, an optional config file and `APP_` environment variables
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let config = config::Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.request_timeout_seconds", 10)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("store.backend", "memory")?
            .set_default("store.timeout_ms", 250)?
            .set_default("blocklist.sweep_interval_seconds", 300)?
            .set_default("defaults.block_period_days", 7)?
            .set_default("defaults.refresh_rate", 100)?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the engine would refuse at its own write boundary
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let period = self.defaults.block_period_days;
        if !BLOCK_PERIOD_RANGE.contains(&period) {
            return Err(config::ConfigError::Message(format!(
                "defaults.block_period_days must be within {}..={}, got {}",
                BLOCK_PERIOD_RANGE.start(),
                BLOCK_PERIOD_RANGE.end(),
                period
            )));
        }
        let rate = self.defaults.refresh_rate;
        if !REFRESH_RATE_RANGE.contains(&rate) {
            return Err(config::ConfigError::Message(format!(
                "defaults.refresh_rate must be within {}..={}, got {}",
                REFRESH_RATE_RANGE.start(),
                REFRESH_RATE_RANGE.end(),
                rate
            )));
        }
        if self.store.timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "store.timeout_ms must be positive".to_string(),
            ));
        }
        if self.blocklist.sweep_interval_seconds == 0 {
            return Err(config::ConfigError::Message(
                "blocklist.sweep_interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                request_timeout_seconds: 10,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                timeout_ms: 250,
            },
            blocklist: BlocklistConfig {
                sweep_interval_seconds: 300,
            },
            defaults: TenantDefaults::default(),
        }
    }
}
