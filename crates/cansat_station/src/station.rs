//! Station wiring.
//!
//! Brings the local stores, telemetry ingestion and the backend together.

use crate::backend::{Backend, BackendCommand, CommandReply};
use crate::config::StationConfig;
use crate::error::StationResult;
use crate::ingest::TelemetryIngest;
use cansat_replication::{MemoryStore, RemoteTarget, SyncEngine};
use tracing::info;

/// Local stores of a station.
#[derive(Debug, Clone)]
pub struct StationStores {
    /// Telemetry.
    pub data: MemoryStore,
    /// Station logs.
    pub log: MemoryStore,
}

impl StationStores {
    /// Creates empty stores named after the configuration.
    pub fn open(config: &StationConfig) -> Self {
        Self {
            data: MemoryStore::new(config.data_store.clone()),
            log: MemoryStore::new(config.log_store.clone()),
        }
    }
}

/// A running ground station.
pub struct Station<E>
where
    E: SyncEngine<Source = MemoryStore, Target = RemoteTarget>,
{
    config: StationConfig,
    stores: StationStores,
    backend: Backend<E>,
    ingest: TelemetryIngest,
}

impl<E> Station<E>
where
    E: SyncEngine<Source = MemoryStore, Target = RemoteTarget> + Clone,
{
    /// Creates a station over `stores`. Must be called inside a Tokio runtime.
    pub fn new(config: StationConfig, stores: StationStores, engine: E) -> Self {
        let backend = Backend::new(
            config.name.clone(),
            stores.data.clone(),
            stores.log.clone(),
            engine,
            config.coordinator_config(),
        );
        let ingest = TelemetryIngest::new(stores.data.clone());

        info!(station = %config.name, "station ready");
        Self {
            config,
            stores,
            backend,
            ingest,
        }
    }

    /// Starts replicating to the configured target, if any.
    pub fn start_replication(&self) -> StationResult<Option<CommandReply>> {
        let Some(target) = &self.config.target else {
            info!("no replication target configured");
            return Ok(None);
        };

        let reply = self.backend.handle_command(BackendCommand::Replicate {
            data_url: target.data_url.clone(),
            log_url: target.log_url.clone(),
            username: target.username.clone(),
            password: target.password.clone(),
        })?;
        Ok(Some(reply))
    }

    /// Stops replication and flushes both stores one last time.
    pub async fn shutdown(&self) {
        info!("station shutdown");
        self.backend.cleanup().await;
    }

    /// The backend connection manager.
    pub fn backend(&self) -> &Backend<E> {
        &self.backend
    }

    /// Telemetry ingestion into the data store.
    pub fn ingest(&self) -> &TelemetryIngest {
        &self.ingest
    }

    /// Local stores.
    pub fn stores(&self) -> &StationStores {
        &self.stores
    }

    /// Configuration the station was built from.
    pub fn config(&self) -> &StationConfig {
        &self.config
    }
}
