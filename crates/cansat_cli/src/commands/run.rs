//! Run command implementation.
//!
//! Replicates into an in-process backend built from the configured target
//! URLs, so a full ingest, replicate and flush cycle can be exercised from the
//! command line.

use cansat_replication::{LoopbackSyncEngine, MemoryStore};
use cansat_station::{
    file_appender, station_subscriber, CommandReply, IngestStats, Station, StationConfig,
    StationStores, StoreLayer,
};
use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{info, warn};
use tracing_subscriber::util::SubscriberInitExt;

/// Result of a station run.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    /// Station name.
    pub station: String,
    /// Telemetry records stored.
    pub stored: u64,
    /// Lines that could not be stored.
    pub malformed: u64,
    /// Documents in the local data store.
    pub local_data: usize,
    /// Documents in the local log store.
    pub local_log: usize,
    /// Documents that reached the backend data store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_data: Option<usize>,
    /// Documents that reached the backend log store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_log: Option<usize>,
}

/// Runs the run command.
pub fn run(
    config_path: &Path,
    input: Option<&Path>,
    verbose: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = StationConfig::load(config_path)?;
    let stores = StationStores::open(&config);

    // The guard flushes the debug file when the run ends.
    let (file, _guard) = match &config.log_file {
        Some(log_file) => {
            let appender = file_appender(log_file, &config.name)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    station_subscriber(
        verbose,
        std::io::stdout,
        file,
        StoreLayer::new(stores.log.clone(), config.log_context_size),
    )
    .init();

    let runtime = tokio::runtime::Runtime::new()?;
    let summary = runtime.block_on(serve(config, stores, input))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => print_text(&summary),
    }
    Ok(())
}

async fn serve(
    config: StationConfig,
    stores: StationStores,
    input: Option<&Path>,
) -> Result<RunSummary, Box<dyn std::error::Error>> {
    let engine = LoopbackSyncEngine::new();
    let remotes = match &config.target {
        Some(target) => {
            let data = MemoryStore::new("backend-data");
            let log = MemoryStore::new("backend-log");
            let credentials = target.credentials();
            if credentials.is_empty() {
                engine.register_remote(&target.data_url, data.clone())?;
                engine.register_remote(&target.log_url, log.clone())?;
            } else {
                engine.register_remote_with_credentials(
                    &target.data_url,
                    data.clone(),
                    credentials.clone(),
                )?;
                engine.register_remote_with_credentials(&target.log_url, log.clone(), credentials)?;
            }
            Some((data, log))
        }
        None => None,
    };

    let station = Station::new(config, stores, engine);
    if let Some(CommandReply::Replicating { data, log }) = station.start_replication()? {
        tokio::spawn(async move {
            let (data, log) = tokio::join!(data, log);
            info!(data = ?data, log = ?log, "initial replication settled");
        });
    }

    let stats = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            ingest_until_interrupted(&station, BufReader::new(file)).await?
        }
        None => ingest_until_interrupted(&station, BufReader::new(tokio::io::stdin())).await?,
    };

    station.shutdown().await;

    let stores = station.stores();
    Ok(RunSummary {
        station: station.config().name.clone(),
        stored: stats.stored,
        malformed: stats.malformed,
        local_data: stores.data.len(),
        local_log: stores.log.len(),
        remote_data: remotes.as_ref().map(|(data, _)| data.len()),
        remote_log: remotes.as_ref().map(|(_, log)| log.len()),
    })
}

async fn ingest_until_interrupted<R>(
    station: &Station<LoopbackSyncEngine>,
    reader: R,
) -> Result<IngestStats, Box<dyn std::error::Error>>
where
    R: AsyncBufRead + Unpin,
{
    let interrupted = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupted"),
            Err(err) => {
                warn!(error = %err, "cannot listen for interrupt");
                std::future::pending::<()>().await;
            }
        }
    };

    Ok(station.ingest().ingest_until(reader, interrupted).await?)
}

fn print_text(summary: &RunSummary) {
    println!("Station: {}", summary.station);
    println!();
    println!("Telemetry:");
    println!("  Stored:    {}", summary.stored);
    println!("  Malformed: {}", summary.malformed);
    println!();
    println!("Local stores:");
    println!("  Data: {} documents", summary.local_data);
    println!("  Log:  {} documents", summary.local_log);
    if let (Some(data), Some(log)) = (summary.remote_data, summary.remote_log) {
        println!();
        println!("Backend:");
        println!("  Data: {} documents", data);
        println!("  Log:  {} documents", log);
    }
}
