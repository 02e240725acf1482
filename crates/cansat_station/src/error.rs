//! Error types for the ground station.

use cansat_replication::SyncError;
use thiserror::Error;

/// Result type for station operations.
pub type StationResult<T> = Result<T, StationError>;

/// Errors that can occur in the ground station.
#[derive(Error, Debug)]
pub enum StationError {
    /// Configuration file is missing fields or has bad values.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Replication failure.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A telemetry record could not be parsed.
    #[error("malformed telemetry: {0}")]
    Telemetry(String),

    /// Command from the backend could not be handled.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The log file could not be opened.
    #[error("log file error: {0}")]
    LogFile(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StationError {
    /// Returns true if the error was caused by operator input rather than
    /// the environment.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            StationError::Config(_) | StationError::InvalidCommand(_) | StationError::Json(_)
        ) || matches!(self, StationError::Sync(SyncError::InvalidTarget(_)))
    }
}
