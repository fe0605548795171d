//! Configuration file parser for ~/.config/feedline/config.toml.
//!
//! The file is optional: a missing or empty file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::schedule::ScheduleSettings;
use crate::util::HostPolicy;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration. Any subset of keys may be given.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file. Defaults to `feedline.db` in the config directory.
    pub database_path: Option<PathBuf>,

    /// Where enclosure downloads land. Defaults to `downloads/` in the
    /// config directory.
    pub download_dir: Option<PathBuf>,

    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,

    pub http_timeout_secs: u64,

    /// Feed documents above this size are rejected.
    pub max_feed_bytes: usize,

    pub user_agent: String,

    /// Lets feeds and enclosures live on localhost or the LAN. Off by
    /// default; redirects are held to the same rule.
    pub allow_private_hosts: bool,

    /// Delay before a scheduled update retries while updates are disabled.
    pub schedule_retry_delay_secs: u64,

    /// Alarms fired later than this are treated as stale.
    pub max_alarm_lateness_secs: u64,

    /// Alarms fired earlier than this are treated as stale.
    pub alarm_early_tolerance_secs: u64,

    /// Share of each channel's items kept after an update, in percent.
    pub old_items_keep_percent: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            download_dir: None,
            log_filter: "feedline=info".to_string(),
            http_timeout_secs: 30,
            max_feed_bytes: 10 * 1024 * 1024,
            user_agent: format!("feedline/{}", env!("CARGO_PKG_VERSION")),
            allow_private_hosts: false,
            schedule_retry_delay_secs: 60,
            max_alarm_lateness_secs: 3600,
            alarm_early_tolerance_secs: 5,
            old_items_keep_percent: 80,
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 11] = [
        "database_path",
        "download_dir",
        "log_filter",
        "http_timeout_secs",
        "max_feed_bytes",
        "user_agent",
        "allow_private_hosts",
        "schedule_retry_delay_secs",
        "max_alarm_lateness_secs",
        "alarm_early_tolerance_secs",
        "old_items_keep_percent",
    ];

    /// Loads configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML or wrong types → `Err(ConfigError::Parse)`
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.old_items_keep_percent > 100 {
            return Err(ConfigError::Invalid(format!(
                "old_items_keep_percent must be at most 100, got {}",
                self.old_items_keep_percent
            )));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "http_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn host_policy(&self) -> HostPolicy {
        HostPolicy::from_allow_private(self.allow_private_hosts)
    }

    pub fn schedule_settings(&self) -> ScheduleSettings {
        ScheduleSettings {
            retry_delay: Duration::from_secs(self.schedule_retry_delay_secs),
            max_lateness: Duration::from_secs(self.max_alarm_lateness_secs),
            early_tolerance: Duration::from_secs(self.alarm_early_tolerance_secs),
        }
    }

    /// Database path, resolved against `config_dir` when unset.
    pub fn database_path_in(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("feedline.db"))
    }

    /// Download directory, resolved against `config_dir` when unset.
    pub fn download_dir_in(&self, config_dir: &Path) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("downloads"))
    }
}

// ============================================================================
// Tests
// ============================================================================
