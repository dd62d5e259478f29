//! Engine configuration.
//!
//! Sources, highest priority last applied:
//! 1. Built-in defaults (see [`defaults`])
//! 2. A TOML file (`spindle.toml` in the working directory, or an explicit path)
//! 3. `SPINDLE_*` environment variables (see [`env_vars`])

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};

/// Default configuration file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "spindle.toml";

/// Default values.
pub mod defaults {
    /// Maximum number of un-acknowledged writes
    pub const OUTSTANDING_LIMIT: usize = 32;
    /// Line terminator appended to every tracked write
    pub const LINE_TERMINATOR: &str = "\n";
    /// GRBL serial receive buffer (128 bytes, one reserved)
    pub const BUFFER_CAPACITY: usize = 127;
    /// How long a stop waits for in-flight acks before flushing them
    pub const STOP_SETTLE_TIMEOUT_MS: u64 = 2_000;
    /// Jog dead-man timeout
    pub const WATCHDOG_TIMEOUT_MS: u64 = 750;
    /// `$EA` alarm catalog request timeout
    pub const ALARM_REQUEST_TIMEOUT_MS: u64 = 5_000;
    /// `?` status poll interval, 0 disables polling
    pub const STATUS_POLL_INTERVAL_MS: u64 = 250;
    /// Event bus capacity
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
}

/// Environment variable names.
pub mod env_vars {
    pub const OUTSTANDING_LIMIT: &str = "SPINDLE_OUTSTANDING_LIMIT";
    pub const BUFFER_CAPACITY: &str = "SPINDLE_BUFFER_CAPACITY";
    pub const STOP_SETTLE_TIMEOUT_MS: &str = "SPINDLE_STOP_SETTLE_TIMEOUT_MS";
    pub const WATCHDOG_TIMEOUT_MS: &str = "SPINDLE_WATCHDOG_TIMEOUT_MS";
    pub const ALARM_REQUEST_TIMEOUT_MS: &str = "SPINDLE_ALARM_REQUEST_TIMEOUT_MS";
    pub const STATUS_POLL_INTERVAL_MS: &str = "SPINDLE_STATUS_POLL_INTERVAL_MS";
    pub const LOG_JSON: &str = "SPINDLE_LOG_JSON";
}

/// Protocol session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of un-acknowledged writes before `write` suspends
    pub outstanding_limit: usize,
    /// Line terminator appended to tracked writes
    pub line_terminator: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outstanding_limit: defaults::OUTSTANDING_LIMIT,
            line_terminator: defaults::LINE_TERMINATOR.to_string(),
        }
    }
}

/// Streaming queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Controller receive buffer capacity in bytes
    pub buffer_capacity: usize,
    /// How long `stop` waits for in-flight acks
    pub stop_settle_timeout_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: defaults::BUFFER_CAPACITY,
            stop_settle_timeout_ms: defaults::STOP_SETTLE_TIMEOUT_MS,
        }
    }
}

/// Jog watchdog settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Dead-man timeout
    pub timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::WATCHDOG_TIMEOUT_MS,
        }
    }
}

/// Alarm catalog settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// `$EA` request timeout
    pub request_timeout_ms: u64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: defaults::ALARM_REQUEST_TIMEOUT_MS,
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `?` status poll interval, 0 disables polling
    pub status_poll_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: defaults::STATUS_POLL_INTERVAL_MS,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub streaming: StreamingConfig,
    pub watchdog: WatchdogConfig,
    pub alarms: AlarmConfig,
    pub telemetry: TelemetryConfig,
}

impl EngineConfig {
    /// Load configuration: explicit path, else `spindle.toml` if present,
    /// else defaults; then environment overrides; then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                info!(category = "config", path = %path.display(), "Loading config file");
                load_toml_file(path)?
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                info!(category = "config", "Loading config from: {}", DEFAULT_CONFIG_FILE);
                load_toml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Apply `SPINDLE_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse(env_vars::OUTSTANDING_LIMIT) {
            self.session.outstanding_limit = v;
        }
        if let Some(v) = env_parse(env_vars::BUFFER_CAPACITY) {
            self.streaming.buffer_capacity = v;
        }
        if let Some(v) = env_parse(env_vars::STOP_SETTLE_TIMEOUT_MS) {
            self.streaming.stop_settle_timeout_ms = v;
        }
        if let Some(v) = env_parse(env_vars::WATCHDOG_TIMEOUT_MS) {
            self.watchdog.timeout_ms = v;
        }
        if let Some(v) = env_parse(env_vars::ALARM_REQUEST_TIMEOUT_MS) {
            self.alarms.request_timeout_ms = v;
        }
        if let Some(v) = env_parse(env_vars::STATUS_POLL_INTERVAL_MS) {
            self.telemetry.status_poll_interval_ms = v;
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.session.outstanding_limit == 0 {
            return Err(EngineError::Config(
                "session.outstanding_limit must be greater than 0".into(),
            ));
        }
        if self.session.line_terminator.is_empty() {
            return Err(EngineError::Config(
                "session.line_terminator must not be empty".into(),
            ));
        }
        if self.streaming.buffer_capacity == 0 {
            return Err(EngineError::Config(
                "streaming.buffer_capacity must be greater than 0".into(),
            ));
        }
        if self.watchdog.timeout_ms == 0 {
            return Err(EngineError::Config(
                "watchdog.timeout_ms must be greater than 0".into(),
            ));
        }
        if self.alarms.request_timeout_ms == 0 {
            return Err(EngineError::Config(
                "alarms.request_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Read and parse any TOML-backed configuration type.
pub fn load_toml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
}

/// Check whether JSON log output was requested.
pub fn log_json() -> bool {
    std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
