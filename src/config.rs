//! Daemon configuration
//!
//! Serde-backed sections matching the documented config keys. Every field
//! has a default so a missing section, or no file at all, yields a working
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub bluetooth: BluetoothConfig,
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Run a scan at startup
    pub initial_scan: bool,
    /// Seconds between periodic scans
    pub periodic_interval_s: u64,
    /// Scan window in seconds
    pub scan_duration_s: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            initial_scan: true,
            periodic_interval_s: 12 * 60 * 60,
            scan_duration_s: 10,
        }
    }
}

impl DiscoveryConfig {
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_s)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Connection cap N
    pub max_concurrent_connections: usize,
    /// BLE connect deadline in seconds
    pub connection_timeout_s: u64,
    /// Adapter name; first adapter when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 1,
            connection_timeout_s: 30,
            adapter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub topic_prefix: String,
    /// Connect attempts before the client goes `FAILED`
    pub max_retries: u32,
    pub initial_retry_delay_s: u64,
    pub max_retry_delay_s: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub connection_timeout_s: u64,
    pub health_check_interval_s: u64,
    /// Bounded in-memory message queue
    pub message_queue_size: usize,
    /// Publish retries per message before it is dropped
    pub message_retry_limit: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            topic_prefix: "batteryhawk".into(),
            max_retries: 10,
            initial_retry_delay_s: 1,
            max_retry_delay_s: 300,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            connection_timeout_s: 30,
            health_check_interval_s: 60,
            message_queue_size: 1000,
            message_retry_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    /// Directory holding the registry documents
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing env-filter directive
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}
