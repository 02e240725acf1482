//! End-to-end tests for the station over the loopback engine.

use cansat_replication::{LoopbackSyncEngine, MemoryStore, ReplicateOutcome, ReplicationState};
use cansat_station::{
    BackendEvent, CommandReply, Station, StationConfig, StationStores, StoreKind, StoreLayer,
    TargetConfig, RECEIVED_FIELD,
};
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;

const DATA_URL: &str = "http://backend.local/cansat-data";
const LOG_URL: &str = "http://backend.local/cansat-log";

fn config() -> StationConfig {
    StationConfig::new("icarus").with_target(TargetConfig {
        data_url: DATA_URL.into(),
        log_url: LOG_URL.into(),
        username: "station".into(),
        password: "secret".into(),
    })
}

fn engine_with_remotes() -> (LoopbackSyncEngine, MemoryStore, MemoryStore) {
    let engine = LoopbackSyncEngine::new();
    let remote_data = MemoryStore::new("remote-data");
    let remote_log = MemoryStore::new("remote-log");
    engine.register_remote(DATA_URL, remote_data.clone()).unwrap();
    engine.register_remote(LOG_URL, remote_log.clone()).unwrap();
    (engine, remote_data, remote_log)
}

#[tokio::test(start_paused = true)]
async fn telemetry_reaches_backend() {
    let (engine, remote_data, _remote_log) = engine_with_remotes();
    let config = config();
    let stores = StationStores::open(&config);
    let station = Station::new(config, stores, engine);

    let reply = station.start_replication().unwrap().unwrap();
    let CommandReply::Replicating { data, log } = reply else {
        panic!("expected replicating reply");
    };
    assert_eq!(data.await, ReplicateOutcome::Connected);
    assert_eq!(log.await, ReplicateOutcome::Connected);

    let input = b"{\"seq\": 1, \"temp\": 20.1}\n{\"seq\": 2, \"temp\": 20.3}\n" as &[u8];
    let stats = station.ingest().ingest_reader(input).await.unwrap();
    assert_eq!(stats.stored, 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote_data.len(), 2);
    let doc = &remote_data.documents()[0];
    assert!(doc.body.get(RECEIVED_FIELD).is_some());

    station.shutdown().await;
    assert_eq!(
        station.backend().coordinator(StoreKind::Data).state(),
        ReplicationState::Cleanup
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_data_written_while_offline() {
    let engine = LoopbackSyncEngine::new();
    let config = config();
    let stores = StationStores::open(&config);
    let station = Station::new(config, stores, engine.clone());

    let _reply = station.start_replication().unwrap();
    station
        .ingest()
        .ingest_line(r#"{"seq": 1}"#)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        station.backend().coordinator(StoreKind::Data).state(),
        ReplicationState::Connecting
    );

    // The backend comes up just before shutdown.
    let remote_data = MemoryStore::new("remote-data");
    engine.register_remote(DATA_URL, remote_data.clone()).unwrap();
    station.backend().coordinator(StoreKind::Data).stop().await;
    station.shutdown().await;

    assert_eq!(remote_data.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn station_logs_are_replicated() {
    let (engine, _remote_data, remote_log) = engine_with_remotes();
    let config = config();
    let stores = StationStores::open(&config);

    let subscriber =
        tracing_subscriber::registry().with(StoreLayer::new(stores.log.clone(), 30));
    let _guard = tracing::subscriber::set_default(subscriber);

    let station = Station::new(config, stores, engine);
    let mut events = station.backend().subscribe();
    let _reply = station.start_replication().unwrap();

    loop {
        if let Ok(BackendEvent::Replicator {
            store: StoreKind::Log,
            state,
        }) = events.recv().await
        {
            if state.is_connected() {
                break;
            }
        }
    }

    tracing::warn!(sensor = "baro", "sensor out of range");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let warning = remote_log
        .documents()
        .into_iter()
        .map(|doc| doc.body)
        .find(|body| body["msg"] == "sensor out of range")
        .unwrap();
    assert_eq!(warning["level"], "WARN");
    assert!(!warning["context"].as_array().unwrap().is_empty());

    station.shutdown().await;
}
