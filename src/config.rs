//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub delivery: DeliveryConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
    /// Bearer token guarding the delivery API. Unset means open.
    pub api_token: Option<String>,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// TCP connect timeout for outbound requests (default: 10)
    pub connect_timeout_secs: u64,
    /// Total request timeout for queued deliveries (default: 20)
    pub timeout_secs: u64,
    /// Total request timeout for the synchronous fast path (default: 5)
    pub fast_path_timeout_secs: u64,
    /// Number of background delivery workers (default: 4)
    pub workers: usize,
    /// Interval between sweeps of eligible STANDBY rows (default: 30)
    pub sweep_interval_secs: u64,
    /// RUNNING rows older than this are returned to STANDBY (default: 300)
    pub stale_running_secs: u64,
    /// User-Agent sent with every delivery
    pub user_agent: String,
}

impl DeliveryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn fast_path_timeout(&self) -> Duration {
        Duration::from_secs(self.fast_path_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_running(&self) -> Duration {
        Duration::from_secs(self.stale_running_secs)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            timeout_secs: 20,
            fast_path_timeout_secs: 5,
            workers: 4,
            sweep_interval_secs: 30,
            stale_running_secs: 300,
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("FediCourier/{}", env!("CARGO_PKG_VERSION"))
}

/// Inbound federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Maximum age of a signed request's Date header (default: 30)
    pub signature_max_age_secs: u64,
    /// Remote public key cache TTL in seconds (default: 3600)
    pub key_cache_ttl_secs: u64,
}

impl FederationConfig {
    pub fn signature_max_age(&self) -> Duration {
        Duration::from_secs(self.signature_max_age_secs)
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_secs)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            signature_max_age_secs: 30,
            key_cache_ttl_secs: 3600,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDICOURIER_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedicourier.db")?
            .set_default("delivery.connect_timeout_secs", 10)?
            .set_default("delivery.timeout_secs", 20)?
            .set_default("delivery.fast_path_timeout_secs", 5)?
            .set_default("delivery.workers", 4)?
            .set_default("delivery.sweep_interval_secs", 30)?
            .set_default("delivery.stale_running_secs", 300)?
            .set_default("delivery.user_agent", default_user_agent())?
            .set_default("federation.signature_max_age_secs", 30)?
            .set_default("federation.key_cache_ttl_secs", 3600)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (FEDICOURIER_*)
            .add_source(
                Environment::with_prefix("FEDICOURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        let delivery = &self.delivery;
        if delivery.connect_timeout_secs == 0 || delivery.timeout_secs == 0 {
            return Err(AppError::Config(
                "delivery timeouts must be greater than 0".to_string(),
            ));
        }

        if delivery.fast_path_timeout_secs == 0
            || delivery.fast_path_timeout_secs > delivery.timeout_secs
        {
            return Err(AppError::Config(format!(
                "delivery.fast_path_timeout_secs must be between 1 and {}",
                delivery.timeout_secs
            )));
        }

        if delivery.workers == 0 {
            return Err(AppError::Config(
                "delivery.workers must be at least 1".to_string(),
            ));
        }

        if self.federation.signature_max_age_secs == 0 {
            return Err(AppError::Config(
                "federation.signature_max_age_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(token) = &self.server.api_token {
            if token.trim().is_empty() {
                return Err(AppError::Config(
                    "server.api_token must not be blank when set".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
                api_token: None,
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/fedicourier-test.db"),
            },
            delivery: DeliveryConfig::default(),
            federation: FederationConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn defaults_match_transport_contract() {
        let delivery = DeliveryConfig::default();
        assert_eq!(delivery.connect_timeout(), Duration::from_secs(10));
        assert_eq!(delivery.timeout(), Duration::from_secs(20));
        assert!(delivery.fast_path_timeout() < delivery.timeout());
        assert_eq!(FederationConfig::default().signature_max_age_secs, 30);
    }

    #[test]
    fn validate_rejects_fast_path_longer_than_total_timeout() {
        let mut config = valid_config();
        config.delivery.fast_path_timeout_secs = 60;

        let error = config
            .validate()
            .expect_err("fast path timeout above total timeout must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("fast_path_timeout_secs")
        ));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = valid_config();
        config.delivery.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_api_token() {
        let mut config = valid_config();
        config.server.api_token = Some("   ".to_string());
        assert!(config.validate().is_err());
    }
}
