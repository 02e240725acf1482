//! # CanSat Replication
//!
//! Keeps a local document store replicated to a remote one over an
//! unreliable link.
//!
//! This crate provides:
//! - Backoff scheduler (exponential delays with jitter, single pending timer)
//! - Replication coordinator (inactive → connecting → active/pause, cleanup)
//! - Sync engine contract with a mock and an in-process loopback engine
//! - Target resolution with default replication ports
//! - In-memory document store
//!
//! ## Key Invariants
//!
//! - At most one replication stream per coordinator at any time
//! - The source store never changes after construction
//! - A retry timer that fires after `stop()` or `cleanup()` is a no-op
//! - `cleanup()` always completes, even if the final flush fails

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(
    not(test),
    warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)
)]

mod backoff;
mod config;
mod coordinator;
mod engine;
mod error;
mod loopback;
mod memory;
mod target;

pub use backoff::{BackoffEvent, BackoffScheduler, ExponentialStrategy};
pub use config::{BackoffConfig, CoordinatorConfig, ReplicationOptions};
pub use coordinator::{Coordinator, PendingReplication, ReplicateOutcome, ReplicationState};
pub use engine::{
    MockFlush, MockStart, MockSyncEngine, ReplicationEvent, ReplicationFeed, ReplicationHandle,
    ReplicationSummary, SyncEngine,
};
pub use error::{SyncError, SyncResult};
pub use loopback::LoopbackSyncEngine;
pub use memory::{Document, MemoryStore};
pub use target::{
    normalize_remote_url, Credentials, RemoteTarget, RemoteTargetResolver, TargetResolver,
    DEFAULT_INSECURE_PORT, DEFAULT_SECURE_PORT,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
