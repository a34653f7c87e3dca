#![deny(unsafe_code)]

//! Configuration loading and validation for the highlight matcher.
//!
//! Loads TOML configuration files and validates them against expected ranges.
//! Provides the [`AppConfig`] type as the central configuration structure.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Worker unit supervision and request deadlines.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Regular-expression compilation limits.
    #[serde(default)]
    pub patterns: PatternsConfig,

    /// Subscription store location.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker unit configuration.
///
/// ## TOML Example
///
/// ```toml
/// [workers]
/// scan_timeout_ms = 5000
/// validation_timeout_ms = 5000
/// resync_on_respawn = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// How long a submitted message waits for every unit before resolving
    /// with partial results.
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    /// How long a pattern validation waits for the regex unit.
    #[serde(default = "default_validation_timeout_ms")]
    pub validation_timeout_ms: u64,

    /// Reload a respawned unit's index from the store right away instead of
    /// waiting for the next external resync.
    #[serde(default = "default_resync_on_respawn")]
    pub resync_on_respawn: bool,
}

impl WorkersConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            validation_timeout_ms: default_validation_timeout_ms(),
            resync_on_respawn: default_resync_on_respawn(),
        }
    }
}

fn default_scan_timeout_ms() -> u64 {
    5_000
}

fn default_validation_timeout_ms() -> u64 {
    5_000
}

fn default_resync_on_respawn() -> bool {
    true
}

/// Limits applied when compiling user-submitted regular expressions.
///
/// Patterns whose compiled program exceeds these limits are treated as
/// invalid, the same as a syntax error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternsConfig {
    /// Maximum size of a compiled program in bytes.
    #[serde(default = "default_size_limit")]
    pub size_limit: usize,

    /// Maximum size of the lazy DFA cache in bytes.
    #[serde(default = "default_dfa_size_limit")]
    pub dfa_size_limit: usize,
}

impl Default for PatternsConfig {
    fn default() -> Self {
        Self {
            size_limit: default_size_limit(),
            dfa_size_limit: default_dfa_size_limit(),
        }
    }
}

fn default_size_limit() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_dfa_size_limit() -> usize {
    2 * 1024 * 1024 // 2 MiB
}

/// Subscription store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the TOML file holding `[[subscriptions]]` entries.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "subscriptions.toml".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.scan_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "workers.scan_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.workers.validation_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "workers.validation_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.patterns.size_limit == 0 {
            return Err(ConfigError::Validation(
                "patterns.size_limit must be non-zero".to_string(),
            ));
        }
        if self.patterns.dfa_size_limit == 0 {
            return Err(ConfigError::Validation(
                "patterns.dfa_size_limit must be non-zero".to_string(),
            ));
        }
        if self.store.path.is_empty() {
            return Err(ConfigError::Validation(
                "store.path must not be empty".to_string(),
            ));
        }
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}
