//! Telemetry ingestion.
//!
//! Decoded telemetry arrives as newline-delimited JSON objects. Each object
//! is stamped with its receive time and stored in the data store, from
//! where the data coordinator replicates it.

use crate::error::{StationError, StationResult};
use cansat_replication::MemoryStore;
use serde_json::Value;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

/// Field added to every stored record.
pub const RECEIVED_FIELD: &str = "_received_ms";

/// Counters for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Records written to the store.
    pub stored: u64,
    /// Blank lines.
    pub skipped: u64,
    /// Lines that were not JSON objects.
    pub malformed: u64,
}

/// Writes telemetry records into the data store.
#[derive(Debug, Clone)]
pub struct TelemetryIngest {
    store: MemoryStore,
}

impl TelemetryIngest {
    /// Creates an ingester writing to `store`.
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    /// Stores one line. Returns the document id, or `None` for a blank line.
    pub fn ingest_line(&self, line: &str) -> StationResult<Option<String>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(line)
            .map_err(|err| StationError::Telemetry(err.to_string()))?;
        let Value::Object(mut record) = value else {
            return Err(StationError::Telemetry("record is not an object".into()));
        };

        record.insert(RECEIVED_FIELD.to_string(), Value::from(now_ms()));
        Ok(Some(self.store.insert(Value::Object(record))))
    }

    /// Stores every line of `reader` until EOF.
    ///
    /// Malformed lines are logged and counted; only I/O errors end the run
    /// early.
    pub async fn ingest_reader<R>(&self, reader: R) -> StationResult<IngestStats>
    where
        R: AsyncBufRead + Unpin,
    {
        self.ingest_until(reader, std::future::pending()).await
    }

    /// Stores lines of `reader` until EOF or until `stop` resolves.
    ///
    /// The returned counters cover every line handled before the stop.
    pub async fn ingest_until<R, F>(&self, reader: R, stop: F) -> StationResult<IngestStats>
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
    {
        let mut stats = IngestStats::default();
        let mut lines = reader.lines();
        let mut line_no = 0u64;
        tokio::pin!(stop);

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                () = &mut stop => {
                    info!(stored = stats.stored, "ingestion stopped");
                    break;
                }
            };
            let Some(line) = line else { break };

            line_no += 1;
            match self.ingest_line(&line) {
                Ok(Some(id)) => {
                    debug!(%id, line = line_no, "stored telemetry");
                    stats.stored += 1;
                }
                Ok(None) => stats.skipped += 1,
                Err(err) => {
                    warn!(line = line_no, error = %err, "skipping malformed telemetry");
                    stats.malformed += 1;
                }
            }
        }

        Ok(stats)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
