//! Configuration loading for the gateway.
//!
//! All tunables live in a TOML file with serde defaults, so a minimal
//! deployment can run with an empty file. The broker password is never placed
//! inline: the `[broker]` section names an environment variable instead and
//! the value is resolved when the bootstrap runs.

use crate::broker::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub storage: StorageSection,
    /// Bootstrap broker endpoint, applied by `init-broker`. Optional: a
    /// deployment may manage the registry purely through operator actions.
    #[serde(default)]
    pub broker: Option<BrokerSection>,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub credentials: CredentialSection,
    #[serde(default)]
    pub health: HealthSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    /// SQLite database path.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> String {
    "fleetgate.db".to_string()
}

/// Bootstrap broker endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_broker_name")]
    pub name: String,
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    pub username: Option<String>,
    /// Environment variable containing the broker password.
    pub password_env: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
}

fn default_broker_name() -> String {
    "bootstrap".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl BrokerSection {
    /// Resolve this section into a registry entry, reading the password from
    /// the named environment variable at call time.
    pub fn to_broker_config(&self) -> BrokerConfig {
        let password = self
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());
        BrokerConfig {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password,
            use_tls: self.use_tls,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeSection {
    /// Supervisory probe cadence in seconds.
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    /// Wall-clock bound for a single connection attempt.
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialSection {
    /// Generated secret length in characters.
    #[serde(default = "default_secret_length")]
    pub secret_length: usize,
}

impl Default for CredentialSection {
    fn default() -> Self {
        Self {
            secret_length: default_secret_length(),
        }
    }
}

fn default_secret_length() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    /// Window within which a device heartbeat counts as recent activity.
    #[serde(default = "default_activity_window")]
    pub activity_window_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            activity_window_secs: default_activity_window(),
        }
    }
}

fn default_activity_window() -> u64 {
    300
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credentials.secret_length < 8 {
            return Err(ConfigError::InvalidConfig(
                "credentials.secret_length must be at least 8".to_string(),
            ));
        }
        if self.probe.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "probe.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.probe.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "probe.interval_secs must be at least 1".to_string(),
            ));
        }
        if let Some(broker) = &self.broker {
            if broker.host.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "broker.host must not be empty".to_string(),
                ));
            }
            if broker.port == 0 {
                return Err(ConfigError::InvalidConfig(
                    "broker.port must not be 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}
