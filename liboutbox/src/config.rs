//! Configuration management for Outbox

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Publish provider endpoints and OAuth client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    pub publish_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Timeout for publish calls, seconds
    pub publish_timeout_secs: u64,
    /// Timeout for token refresh calls, seconds
    pub token_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "linkedin".to_string(),
            publish_url: "https://api.linkedin.com/v2/ugcPosts".to_string(),
            token_url: "https://www.linkedin.com/oauth/v2/accessToken".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            publish_timeout_secs: 10,
            token_timeout_secs: 15,
        }
    }
}

/// Task transport between the scanner and the workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub scan_interval_secs: u64,
    /// Tasks not claimed within this window are dropped on claim.
    /// Kept just under the scan interval so a stale task dies before
    /// its successor is enqueued.
    pub task_expiry_secs: u64,
    pub queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            task_expiry_secs: 55,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub workers: usize,
    /// Retries after the first attempt, transient errors only
    pub max_retries: u32,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    pub soft_time_limit_secs: u64,
    pub hard_time_limit_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_base_secs: 60,
            retry_cap_secs: 300,
            soft_time_limit_secs: 240,
            hard_time_limit_secs: 300,
        }
    }
}

/// Credential encryption behavior.
///
/// The key itself is never read from the config file; it comes from the
/// `OUTBOX_ENCRYPTION_KEY` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// "strict" refuses to start without a key; "permissive" falls back
    /// to plaintext storage with a loud warning
    pub mode: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            mode: "permissive".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/outbox/outbox.db".to_string(),
            },
            provider: ProviderConfig::default(),
            broker: BrokerConfig::default(),
            dispatch: DispatchSection::default(),
            encryption: EncryptionConfig::default(),
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("OUTBOX_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("outbox").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("outbox"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "/tmp/outbox.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.database.path, "/tmp/outbox.db");
        assert_eq!(config.provider.name, "linkedin");
        assert_eq!(config.broker.scan_interval_secs, 60);
        assert_eq!(config.broker.task_expiry_secs, 55);
        assert_eq!(config.dispatch.max_retries, 3);
        assert_eq!(config.dispatch.retry_base_secs, 60);
        assert_eq!(config.dispatch.hard_time_limit_secs, 300);
        assert_eq!(config.encryption.mode, "permissive");
    }

    #[test]
    fn test_task_expiry_defaults_below_scan_interval() {
        let broker = BrokerConfig::default();
        assert!(broker.task_expiry_secs < broker.scan_interval_secs);
    }

    #[test]
    fn test_full_config_round_trip() {
        let config = Config::default_config();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.database.path, config.database.path);
        assert_eq!(parsed.provider.publish_url, config.provider.publish_url);
        assert_eq!(parsed.dispatch.workers, config.dispatch.workers);
    }

    #[test]
    fn test_config_overrides() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "/tmp/outbox.db"

            [broker]
            scan_interval_secs = 5
            task_expiry_secs = 4

            [dispatch]
            workers = 1
            retry_base_secs = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.scan_interval_secs, 5);
        assert_eq!(config.broker.task_expiry_secs, 4);
        assert_eq!(config.dispatch.workers, 1);
        assert_eq!(config.dispatch.retry_base_secs, 1);
        // Untouched sections keep their defaults
        assert_eq!(config.dispatch.max_retries, 3);
    }

    #[test]
    fn test_load_from_missing_path() {
        let path = PathBuf::from("/nonexistent/outbox/config.toml");
        assert!(Config::load_from_path(&path).is_err());
    }
}
