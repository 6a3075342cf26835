//! Configuration management for the click fraud service.
//! Settings are layered from built-in defaults, an optional `config` file
//! and `APP__`-separated environment variables.

mod settings;

pub use settings::{
    BlocklistConfig, RedisConfig, ServerConfig, Settings, StoreBackend, StoreConfig,
    TenantDefaults,
};

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, config::ConfigError>;

/// Load and validate the service settings
pub fn load_config() -> ConfigResult<Settings> {
    Settings::load()
}
