//! # CanSat Station
//!
//! Ground-station side of the CanSat telemetry pipeline.
//!
//! This crate provides:
//! - Backend connection manager with data and log replication coordinators
//! - Station configuration file
//! - Logging setup: console, rotating file and a tracing layer that stores
//!   log records for replication
//! - Newline-delimited JSON telemetry ingestion

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(
    not(test),
    warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)
)]

mod backend;
mod config;
mod error;
mod ingest;
mod logging;
mod station;

pub use backend::{
    Backend, BackendCommand, BackendEvent, CommandReply, LinkEvent, LinkState, StationInfo,
    StoreKind,
};
pub use config::{
    BackoffOverrides, LogFileConfig, StationConfig, TargetConfig, DEFAULT_LOG_CONTEXT_SIZE,
    DEFAULT_LOG_MAX_FILES,
};
pub use error::{StationError, StationResult};
pub use ingest::{IngestStats, TelemetryIngest, RECEIVED_FIELD};
pub use logging::{env_filter, file_appender, station_subscriber, StoreLayer, LOG_FILE_PREFIX};
pub use station::{Station, StationStores};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
