//! # Client Configuration
//!
//! Configuration for the data layer: API location, token timing, storage
//! and retry limits.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FINSYNC_API_BASE_URL=https://api.example.com/v1/                   │
//! │     FINSYNC_DATABASE_PATH=/var/lib/app/finsync.db                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/finsync/finsync.toml (Linux)                             │
//! │     ~/Library/Application Support/com.finsync.finsync/finsync.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [api]
//! base_url = "https://api.example.com/v1/"
//!
//! [auth]
//! refresh_margin_secs = 300
//! refresh_timeout_secs = 30
//! default_token_lifetime_secs = 3600
//!
//! [storage]
//! database_path = "/var/lib/app/finsync.db"
//! max_connections = 5
//!
//! [retry]
//! initial_backoff_ms = 500
//! max_backoff_secs = 30
//! max_elapsed_secs = 120   # 0 = retry until success or a permanent error
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use finsync_core::{
    DEFAULT_REFRESH_MARGIN_SECS, DEFAULT_TOKEN_LIFETIME_SECS, MAX_TOKEN_LIFETIME_SECS,
};
use finsync_db::DbConfig;

use crate::auth::{TokenManagerSettings, DEFAULT_REFRESH_TIMEOUT_SECS};
use crate::collection::RetryPolicy;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// API Settings
// =============================================================================

/// Where the API lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Base URL that request paths are resolved against.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "http://localhost:8080/".to_string()
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            base_url: default_base_url(),
        }
    }
}

// =============================================================================
// Auth Settings
// =============================================================================

/// Token lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Tokens expiring within this many seconds are refreshed early.
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: i64,

    /// Upper bound on one refresh round trip (seconds).
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,

    /// Lifetime assumed for tokens with no expiry information (seconds).
    #[serde(default = "default_token_lifetime")]
    pub default_token_lifetime_secs: i64,
}

fn default_refresh_margin() -> i64 {
    DEFAULT_REFRESH_MARGIN_SECS
}

fn default_refresh_timeout() -> u64 {
    DEFAULT_REFRESH_TIMEOUT_SECS
}

fn default_token_lifetime() -> i64 {
    DEFAULT_TOKEN_LIFETIME_SECS
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            refresh_margin_secs: default_refresh_margin(),
            refresh_timeout_secs: default_refresh_timeout(),
            default_token_lifetime_secs: default_token_lifetime(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Entity store location and pool size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Database file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Keep the store in memory only.
    #[serde(default)]
    pub in_memory: bool,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: None,
            in_memory: false,
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Backoff limits for fetch-and-reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Give up after this long. Set to 0 for no limit.
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed_secs: u64,
}

fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    30
}
fn default_max_elapsed() -> u64 {
    120
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_elapsed_secs: default_max_elapsed(),
        }
    }
}

// =============================================================================
// Main Client Configuration
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (finsync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading client config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load client config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Client config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let url = Url::parse(&self.api.base_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "API base URL must use http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if !(0..=MAX_TOKEN_LIFETIME_SECS).contains(&self.auth.refresh_margin_secs) {
            return Err(SyncError::InvalidConfig(format!(
                "refresh_margin_secs must be between 0 and {}",
                MAX_TOKEN_LIFETIME_SECS
            )));
        }
        if self.auth.refresh_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }
        if !(1..=MAX_TOKEN_LIFETIME_SECS).contains(&self.auth.default_token_lifetime_secs) {
            return Err(SyncError::InvalidConfig(format!(
                "default_token_lifetime_secs must be between 1 and {}",
                MAX_TOKEN_LIFETIME_SECS
            )));
        }

        if self.storage.max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.retry.initial_backoff_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("FINSYNC_API_BASE_URL") {
            debug!(url = %url, "Overriding API base URL from environment");
            self.api.base_url = url;
        }

        if let Some(path) = lookup("FINSYNC_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = Some(PathBuf::from(path));
        }

        if let Some(value) = lookup("FINSYNC_IN_MEMORY") {
            self.storage.in_memory = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(value) = lookup("FINSYNC_MAX_CONNECTIONS") {
            match value.parse::<u32>() {
                Ok(n) => self.storage.max_connections = n,
                Err(_) => warn!(value = %value, "Ignoring invalid FINSYNC_MAX_CONNECTIONS"),
            }
        }

        if let Some(value) = lookup("FINSYNC_REFRESH_MARGIN_SECS") {
            match value.parse::<i64>() {
                Ok(n) => self.auth.refresh_margin_secs = n,
                Err(_) => warn!(value = %value, "Ignoring invalid FINSYNC_REFRESH_MARGIN_SECS"),
            }
        }

        if let Some(value) = lookup("FINSYNC_REFRESH_TIMEOUT_SECS") {
            match value.parse::<u64>() {
                Ok(n) => self.auth.refresh_timeout_secs = n,
                Err(_) => warn!(value = %value, "Ignoring invalid FINSYNC_REFRESH_TIMEOUT_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "finsync", "finsync")
            .map(|dirs| dirs.config_dir().join("finsync.toml"))
    }

    /// Returns the default database path.
    pub fn default_database_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "finsync", "finsync")
            .map(|dirs| dirs.data_dir().join("finsync.db"))
    }

    // =========================================================================
    // Derived Settings
    // =========================================================================

    pub fn base_url(&self) -> SyncResult<Url> {
        Ok(Url::parse(&self.api.base_url)?)
    }

    /// Store configuration. Falls back to memory when no path is known.
    pub fn db_config(&self) -> DbConfig {
        if self.storage.in_memory {
            return DbConfig::in_memory();
        }

        match self
            .storage
            .database_path
            .clone()
            .or_else(Self::default_database_path)
        {
            Some(path) => DbConfig::new(path).max_connections(self.storage.max_connections),
            None => {
                warn!("No database path available, using an in-memory store");
                DbConfig::in_memory()
            }
        }
    }

    /// Out-of-range seconds are clamped; [`validate`](Self::validate)
    /// rejects them up front.
    pub fn token_settings(&self) -> TokenManagerSettings {
        TokenManagerSettings {
            refresh_margin: lifetime_secs(self.auth.refresh_margin_secs, 0),
            refresh_timeout: Duration::from_secs(self.auth.refresh_timeout_secs),
            default_lifetime: lifetime_secs(self.auth.default_token_lifetime_secs, 1),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.retry.initial_backoff_ms),
            max_interval: Duration::from_secs(self.retry.max_backoff_secs),
            max_elapsed: match self.retry.max_elapsed_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

fn lifetime_secs(secs: i64, min: i64) -> chrono::Duration {
    chrono::Duration::seconds(secs.clamp(min, MAX_TOKEN_LIFETIME_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.auth.refresh_margin_secs, 300);
        assert_eq!(config.storage.max_connections, 5);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClientConfig::default();

        config.api.base_url = "ws://localhost:8080".to_string();
        assert!(config.validate().is_err());

        config.api.base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.api.base_url = "https://api.example.com/v1/".to_string();
        config.auth.refresh_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_token_lifetimes_are_bounded() {
        let mut config = ClientConfig::default();
        config.auth.refresh_margin_secs = i64::MAX;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        config.auth.refresh_margin_secs = 300;
        config.auth.default_token_lifetime_secs = i64::MAX / 1000;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        config.auth.refresh_margin_secs = i64::MAX;
        let settings = config.token_settings();
        assert_eq!(settings.refresh_margin.num_seconds(), MAX_TOKEN_LIFETIME_SECS);
        assert_eq!(settings.default_lifetime.num_seconds(), MAX_TOKEN_LIFETIME_SECS);

        config.auth.default_token_lifetime_secs = -1;
        assert_eq!(config.token_settings().default_lifetime.num_seconds(), 1);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("FINSYNC_API_BASE_URL", "https://override.example.com/"),
            ("FINSYNC_MAX_CONNECTIONS", "not-a-number"),
            ("FINSYNC_REFRESH_MARGIN_SECS", "60"),
            ("FINSYNC_IN_MEMORY", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.api.base_url, "https://override.example.com/");
        assert_eq!(config.storage.max_connections, 5);
        assert_eq!(config.auth.refresh_margin_secs, 60);
        assert!(config.db_config().is_in_memory());
    }

    #[test]
    fn test_retry_policy_zero_means_unbounded() {
        let mut config = ClientConfig::default();
        config.retry.max_elapsed_secs = 0;
        assert_eq!(config.retry_policy().max_elapsed, None);
    }

    #[test]
    fn test_toml_serialization() {
        let config = ClientConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[api]"));
        assert!(toml_str.contains("[retry]"));
    }
}
