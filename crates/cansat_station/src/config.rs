//! Station configuration file.
//!
//! The station reads a JSON file such as:
//!
//! ```json
//! {
//!   "name": "icarus",
//!   "target": {
//!     "data_url": "https://backend.example/data",
//!     "log_url": "https://backend.example/log",
//!     "username": "station",
//!     "password": "secret"
//!   },
//!   "backoff": { "initial_delay_ms": 250 },
//!   "log_file": { "directory": "logs" }
//! }
//! ```

use crate::error::{StationError, StationResult};
use cansat_replication::{BackoffConfig, CoordinatorConfig, Credentials};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of log records attached to warnings and errors.
pub const DEFAULT_LOG_CONTEXT_SIZE: usize = 30;

/// Default number of hourly log files kept on disk (five days).
pub const DEFAULT_LOG_MAX_FILES: usize = 120;

fn default_data_store() -> String {
    "data".to_string()
}

fn default_log_store() -> String {
    "log".to_string()
}

fn default_log_context_size() -> usize {
    DEFAULT_LOG_CONTEXT_SIZE
}

fn default_log_max_files() -> usize {
    DEFAULT_LOG_MAX_FILES
}

/// Ground station configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StationConfig {
    /// Station name reported to the backend.
    pub name: String,
    /// Name of the local telemetry store.
    #[serde(default = "default_data_store")]
    pub data_store: String,
    /// Name of the local log store.
    #[serde(default = "default_log_store")]
    pub log_store: String,
    /// Backend stores to replicate to, if known at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetConfig>,
    /// Log records attached to stored warnings and errors.
    #[serde(default = "default_log_context_size")]
    pub log_context_size: usize,
    /// Overrides for the replication backoff.
    #[serde(default)]
    pub backoff: BackoffOverrides,
    /// Upper bound for the shutdown flush, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_timeout_ms: Option<u64>,
    /// Rotating debug log on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<LogFileConfig>,
}

/// Rotating log file settings. Files roll over every hour and are named
/// `CanSatGS-<station>.<date-hour>.log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogFileConfig {
    /// Directory holding the log files.
    pub directory: PathBuf,
    /// Files kept before the oldest is deleted.
    #[serde(default = "default_log_max_files")]
    pub max_files: usize,
}

impl LogFileConfig {
    /// Logs into `directory` with the default retention.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_files: DEFAULT_LOG_MAX_FILES,
        }
    }
}

/// Where to replicate.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Remote telemetry store.
    pub data_url: String,
    /// Remote log store.
    pub log_url: String,
    /// Username for both stores.
    #[serde(default)]
    pub username: String,
    /// Password for both stores.
    #[serde(default)]
    pub password: String,
}

impl TargetConfig {
    /// Credentials for both stores.
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("data_url", &self.data_url)
            .field("log_url", &self.log_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Optional backoff settings. Missing values keep the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffOverrides {
    /// Delay before the first retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    /// Ceiling for retry delays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Growth factor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,
    /// Jitter fraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub randomisation_factor: Option<f64>,
}

impl BackoffOverrides {
    /// Applies the overrides on top of `base`.
    pub fn apply(&self, base: BackoffConfig) -> BackoffConfig {
        let mut config = base;
        if let Some(ms) = self.initial_delay_ms {
            config = config.with_initial_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.max_delay_ms {
            config = config.with_max_delay(Duration::from_millis(ms));
        }
        if let Some(factor) = self.factor {
            config = config.with_factor(factor);
        }
        if let Some(r) = self.randomisation_factor {
            config = config.with_randomisation_factor(r);
        }
        config
    }
}

impl StationConfig {
    /// Creates a configuration with default store names and no target.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_store: default_data_store(),
            log_store: default_log_store(),
            target: None,
            log_context_size: DEFAULT_LOG_CONTEXT_SIZE,
            backoff: BackoffOverrides::default(),
            flush_timeout_ms: None,
            log_file: None,
        }
    }

    /// Sets the replication target.
    pub fn with_target(mut self, target: TargetConfig) -> Self {
        self.target = Some(target);
        self
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> StationResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> StationResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|err| match err {
            StationError::Json(err) => {
                StationError::Config(format!("{}: {}", path.display(), err))
            }
            other => other,
        })
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> StationResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Checks values serde cannot check.
    pub fn validate(&self) -> StationResult<()> {
        if self.name.trim().is_empty() {
            return Err(StationError::Config("station name is empty".into()));
        }
        if self.data_store.is_empty() || self.log_store.is_empty() {
            return Err(StationError::Config("store names must not be empty".into()));
        }
        if self.data_store == self.log_store {
            return Err(StationError::Config(format!(
                "data and log stores share the name {:?}",
                self.data_store
            )));
        }
        if let Some(target) = &self.target {
            if target.data_url.is_empty() || target.log_url.is_empty() {
                return Err(StationError::Config("target urls must not be empty".into()));
            }
        }

        if let Some(log_file) = &self.log_file {
            if log_file.directory.as_os_str().is_empty() {
                return Err(StationError::Config("log directory is empty".into()));
            }
            if log_file.max_files == 0 {
                return Err(StationError::Config("log max_files must be at least 1".into()));
            }
        }

        let backoff = self.backoff_config();
        if backoff.factor < 1.0 {
            return Err(StationError::Config(format!(
                "backoff factor {} is below 1",
                backoff.factor
            )));
        }
        if backoff.initial_delay > backoff.max_delay {
            return Err(StationError::Config(
                "backoff initial delay exceeds max delay".into(),
            ));
        }
        Ok(())
    }

    /// Backoff settings after overrides.
    pub fn backoff_config(&self) -> BackoffConfig {
        self.backoff.apply(BackoffConfig::default())
    }

    /// Coordinator settings after overrides.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let config = CoordinatorConfig::new().with_backoff(self.backoff_config());
        match self.flush_timeout_ms {
            Some(ms) => config.with_flush_timeout(Duration::from_millis(ms)),
            None => config,
        }
    }
}
