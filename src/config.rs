// ABOUTME: Configuration loading for convoy.
// ABOUTME: Reads ~/.convoy/config.toml with serde defaults; CONVOY_DATA_DIR overrides the data dir.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::session::{PersistPolicy, StoreOptions};

/// Environment variable that overrides `storage.data_dir`.
pub const DATA_DIR_ENV: &str = "CONVOY_DATA_DIR";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

/// Where session files live.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

/// Timeout, retry, and notification settings for durable writes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub event_buffer: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_attempts: 0,
            retry_backoff_ms: 250,
            event_buffer: 256,
        }
    }
}

impl PersistenceConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            policy: PersistPolicy {
                timeout: Duration::from_secs(self.timeout_seconds.max(1)),
                retry_attempts: self.retry_attempts,
                retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            },
            event_buffer: self.event_buffer,
        }
    }
}

/// Log filter used when RUST_LOG is not set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "convoy=info".to_string(),
        }
    }
}

impl Config {
    /// Load config from ~/.convoy/config.toml, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from an explicit path, falling back to defaults if it is missing.
    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every persistence call fail.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.persistence.timeout_seconds == 0 {
            anyhow::bail!("persistence.timeout_seconds must be at least 1");
        }
        Ok(())
    }

    /// Path to the config file.
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".convoy")
            .join("config.toml")
    }

    /// Path to an optional .env file loaded at startup.
    pub fn env_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".convoy")
            .join(".env")
    }

    /// Directory holding session data: env override, then config, then the XDG data dir.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(dir);
        }
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(Self::default_data_dir)
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("convoy")
            .join("sessions")
    }
}
