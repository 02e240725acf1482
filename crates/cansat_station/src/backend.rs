//! Backend connection manager.
//!
//! Owns the data and log replication coordinators, tracks the state of the
//! control link to the backend and answers backend commands. Coordinator
//! state transitions and link transitions are forwarded to subscribers as
//! [`BackendEvent`]s.

use crate::error::{StationError, StationResult};
use cansat_replication::{
    Coordinator, CoordinatorConfig, Credentials, PendingReplication, RemoteTarget,
    RemoteTargetResolver, ReplicationState, SyncEngine,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the backend event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Which local store a coordinator replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Telemetry.
    Data,
    /// Station logs.
    Log,
}

impl StoreKind {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Data => "data",
            StoreKind::Log => "log",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the control link to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No link wanted.
    Inactive,
    /// First connection attempt in progress.
    Connecting,
    /// Reconnecting after losing the link.
    Reconnecting,
    /// Link established.
    Connected,
    /// The first connection attempt failed.
    ConnectError,
    /// A reconnection attempt failed.
    ReconnectError,
    /// The backend went away.
    Disconnected,
    /// The station is shutting down.
    Cleanup,
}

impl LinkState {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Inactive => "inactive",
            LinkState::Connecting => "connecting",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Connected => "connected",
            LinkState::ConnectError => "connect_error",
            LinkState::ReconnectError => "reconnect_error",
            LinkState::Disconnected => "disconnected",
            LinkState::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event reported by the control link transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A (re)connection attempt started.
    Reconnecting {
        /// Attempt number reported by the transport.
        attempt: u32,
    },
    /// A (re)connection attempt failed.
    ReconnectError,
    /// The link is up.
    Connected,
    /// The link went down.
    Disconnected,
}

/// Event forwarded to backend subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// The control link changed state.
    Link(LinkState),
    /// A coordinator changed state.
    Replicator {
        /// Store the coordinator replicates.
        store: StoreKind,
        /// New coordinator state.
        state: ReplicationState,
    },
}

/// Command sent by the backend.
#[derive(Clone, PartialEq, Eq)]
pub enum BackendCommand {
    /// Replicate both stores to the given URLs.
    Replicate {
        /// Remote telemetry store.
        data_url: String,
        /// Remote log store.
        log_url: String,
        /// Username for both stores.
        username: String,
        /// Password for both stores.
        password: String,
    },
    /// Report station information.
    Info,
}

impl fmt::Debug for BackendCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendCommand::Replicate {
                data_url,
                log_url,
                username,
                ..
            } => f
                .debug_struct("Replicate")
                .field("data_url", data_url)
                .field("log_url", log_url)
                .field("username", username)
                .finish_non_exhaustive(),
            BackendCommand::Info => f.write_str("Info"),
        }
    }
}

/// Station details answered to [`BackendCommand::Info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StationInfo {
    /// Station name.
    pub name: String,
    /// Station software version.
    pub version: String,
}

/// Reply to a [`BackendCommand`].
#[derive(Debug)]
pub enum CommandReply {
    /// Replication started; the futures resolve on first connection.
    Replicating {
        /// Data coordinator.
        data: PendingReplication,
        /// Log coordinator.
        log: PendingReplication,
    },
    /// Station information.
    Info(StationInfo),
}

type StationCoordinator<E> = Coordinator<E, RemoteTargetResolver>;

/// Manages the data and log coordinators and the control link state.
///
/// Construction spawns Tokio tasks, so it must happen inside a runtime.
pub struct Backend<E: SyncEngine<Target = RemoteTarget>> {
    name: String,
    data: StationCoordinator<E>,
    log: StationCoordinator<E>,
    link: Mutex<LinkState>,
    events: broadcast::Sender<BackendEvent>,
    forwarders: Vec<JoinHandle<()>>,
}

impl<E> Backend<E>
where
    E: SyncEngine<Target = RemoteTarget> + Clone,
{
    /// Creates the backend with one coordinator per local store.
    pub fn new(
        name: impl Into<String>,
        data_source: E::Source,
        log_source: E::Source,
        engine: E,
        config: CoordinatorConfig,
    ) -> Self {
        let name = name.into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let data = Coordinator::new(
            StoreKind::Data.as_str(),
            data_source,
            engine.clone(),
            RemoteTargetResolver::new(),
            config.clone(),
        );
        let log = Coordinator::new(
            StoreKind::Log.as_str(),
            log_source,
            engine,
            RemoteTargetResolver::new(),
            config,
        );

        let forwarders = vec![
            forward_states(StoreKind::Data, data.subscribe(), events.clone()),
            forward_states(StoreKind::Log, log.subscribe(), events.clone()),
        ];

        info!(station = %name, "backend constructed");
        Self {
            name,
            data,
            log,
            link: Mutex::new(LinkState::Inactive),
            events,
            forwarders,
        }
    }

    /// Station name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribes to link and coordinator transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    /// Current control link state.
    pub fn link_state(&self) -> LinkState {
        *self.link.lock()
    }

    /// The coordinator for `store`.
    pub fn coordinator(&self, store: StoreKind) -> &StationCoordinator<E> {
        match store {
            StoreKind::Data => &self.data,
            StoreKind::Log => &self.log,
        }
    }

    /// Handles a command from the backend.
    pub fn handle_command(&self, command: BackendCommand) -> StationResult<CommandReply> {
        debug!(?command, "backend command");
        match command {
            BackendCommand::Replicate {
                data_url,
                log_url,
                username,
                password,
            } => {
                if data_url.is_empty() || log_url.is_empty() {
                    return Err(StationError::InvalidCommand(
                        "replicate needs both a data and a log url".into(),
                    ));
                }
                let credentials = Credentials::new(username, password);
                // Both targets resolve before either coordinator starts.
                let data = self.data.resolve(&data_url, &credentials)?;
                let log = self.log.resolve(&log_url, &credentials)?;
                info!(
                    %data_url,
                    %log_url,
                    username = credentials.username().unwrap_or_default(),
                    "replication requested"
                );
                Ok(CommandReply::Replicating {
                    data: self.data.replicate_resolved(data),
                    log: self.log.replicate_resolved(log),
                })
            }
            BackendCommand::Info => Ok(CommandReply::Info(self.info())),
        }
    }

    /// Station name and version.
    pub fn info(&self) -> StationInfo {
        StationInfo {
            name: self.name.clone(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Applies a transport event to the link state.
    pub fn handle_link_event(&self, event: LinkEvent) {
        let mut link = self.link.lock();
        let next = match event {
            LinkEvent::Reconnecting { attempt } => {
                debug!(attempt, "link reconnecting");
                if *link == LinkState::Inactive {
                    LinkState::Connecting
                } else {
                    LinkState::Reconnecting
                }
            }
            LinkEvent::ReconnectError => {
                if *link == LinkState::Connecting {
                    LinkState::ConnectError
                } else {
                    LinkState::ReconnectError
                }
            }
            LinkEvent::Connected => LinkState::Connected,
            LinkEvent::Disconnected => LinkState::Disconnected,
        };
        self.update_link(&mut link, next);
    }

    /// Stops both coordinators and drops the link.
    ///
    /// The coordinators stay off until the next replicate command.
    pub async fn disconnect(&self) {
        info!("backend disconnect");
        tokio::join!(self.data.stop(), self.log.stop());
        let mut link = self.link.lock();
        self.update_link(&mut link, LinkState::Inactive);
    }

    /// Cleans up both coordinators concurrently. Always completes.
    pub async fn cleanup(&self) {
        info!("backend cleanup");
        {
            let mut link = self.link.lock();
            self.update_link(&mut link, LinkState::Cleanup);
        }
        tokio::join!(self.data.cleanup(), self.log.cleanup());
    }

    fn update_link(&self, link: &mut LinkState, next: LinkState) {
        info!(state = %next, "update link state");
        *link = next;
        let _ = self.events.send(BackendEvent::Link(next));
    }
}

impl<E: SyncEngine<Target = RemoteTarget>> Drop for Backend<E> {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

impl<E: SyncEngine<Target = RemoteTarget>> fmt::Debug for Backend<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("link", &*self.link.lock())
            .field("data", &self.data)
            .field("log", &self.log)
            .finish()
    }
}

fn forward_states(
    store: StoreKind,
    mut states: broadcast::Receiver<ReplicationState>,
    events: broadcast::Sender<BackendEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match states.recv().await {
                Ok(state) => {
                    let _ = events.send(BackendEvent::Replicator { store, state });
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(%store, missed, "dropped replicator state updates");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cansat_replication::{MockSyncEngine, ReplicateOutcome, ReplicationEvent, SyncError};
    use std::sync::Arc;
    use std::time::Duration;

    fn backend() -> (Backend<Arc<MockSyncEngine>>, Arc<MockSyncEngine>) {
        let engine = Arc::new(MockSyncEngine::new());
        let backend = Backend::new(
            "icarus",
            "data".to_string(),
            "log".to_string(),
            Arc::clone(&engine),
            CoordinatorConfig::new(),
        );
        (backend, engine)
    }

    fn replicate_command() -> BackendCommand {
        BackendCommand::Replicate {
            data_url: "https://backend.local/data".into(),
            log_url: "https://backend.local/log".into(),
            username: "station".into(),
            password: "secret".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn info_command() {
        let (backend, _engine) = backend();
        match backend.handle_command(BackendCommand::Info).unwrap() {
            CommandReply::Info(info) => {
                assert_eq!(info.name, "icarus");
                assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
            }
            other => panic!("expected info, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replicate_starts_both_coordinators() {
        let (backend, engine) = backend();

        let reply = backend.handle_command(replicate_command()).unwrap();
        engine.wait_for_starts(2).await;

        let mut urls: Vec<_> = engine
            .starts()
            .into_iter()
            .map(|s| (s.source, s.target.url().to_string()))
            .collect();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                ("data".to_string(), "https://backend.local:6984/data".to_string()),
                ("log".to_string(), "https://backend.local:6984/log".to_string()),
            ]
        );

        engine.emit(0, ReplicationEvent::Active);
        engine.emit(1, ReplicationEvent::Paused(None));
        match reply {
            CommandReply::Replicating { data, log } => {
                assert_eq!(data.await, ReplicateOutcome::Connected);
                assert_eq!(log.await, ReplicateOutcome::Connected);
            }
            other => panic!("expected replicating, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replicate_requires_urls() {
        let (backend, _engine) = backend();
        let command = BackendCommand::Replicate {
            data_url: String::new(),
            log_url: "http://backend/log".into(),
            username: String::new(),
            password: String::new(),
        };
        assert!(matches!(
            backend.handle_command(command),
            Err(StationError::InvalidCommand(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_log_url_starts_nothing() {
        let (backend, engine) = backend();
        let command = BackendCommand::Replicate {
            data_url: "http://backend.local/data".into(),
            log_url: "http://backend.local:notaport/log".into(),
            username: String::new(),
            password: String::new(),
        };

        assert!(matches!(
            backend.handle_command(command),
            Err(StationError::Sync(SyncError::InvalidTarget(_)))
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.start_count(), 0);
        for store in [StoreKind::Data, StoreKind::Log] {
            assert_eq!(
                backend.coordinator(store).state(),
                ReplicationState::Inactive
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_states_are_forwarded() {
        let (backend, _engine) = backend();
        let mut events = backend.subscribe();

        let _reply = backend.handle_command(replicate_command()).unwrap();

        let mut stores = Vec::new();
        while stores.len() < 2 {
            if let BackendEvent::Replicator { store, state } = events.recv().await.unwrap() {
                assert_eq!(state, ReplicationState::Connecting);
                if !stores.contains(&store) {
                    stores.push(store);
                }
            }
        }
        stores.sort_by_key(|s| s.as_str());
        assert_eq!(stores, vec![StoreKind::Data, StoreKind::Log]);
    }

    #[tokio::test(start_paused = true)]
    async fn link_state_follows_transport() {
        let (backend, _engine) = backend();
        assert_eq!(backend.link_state(), LinkState::Inactive);

        backend.handle_link_event(LinkEvent::Reconnecting { attempt: 1 });
        assert_eq!(backend.link_state(), LinkState::Connecting);
        backend.handle_link_event(LinkEvent::ReconnectError);
        assert_eq!(backend.link_state(), LinkState::ConnectError);

        backend.handle_link_event(LinkEvent::Connected);
        assert_eq!(backend.link_state(), LinkState::Connected);
        backend.handle_link_event(LinkEvent::Disconnected);
        backend.handle_link_event(LinkEvent::Reconnecting { attempt: 2 });
        assert_eq!(backend.link_state(), LinkState::Reconnecting);
        backend.handle_link_event(LinkEvent::ReconnectError);
        assert_eq!(backend.link_state(), LinkState::ReconnectError);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_replication() {
        let (backend, engine) = backend();
        let _reply = backend.handle_command(replicate_command()).unwrap();
        engine.wait_for_starts(2).await;
        backend.handle_link_event(LinkEvent::Connected);

        backend.disconnect().await;

        assert_eq!(backend.link_state(), LinkState::Inactive);
        assert_eq!(engine.live_handles(), 0);
        assert_eq!(
            backend.coordinator(StoreKind::Data).state(),
            ReplicationState::Inactive
        );
        assert_eq!(
            backend.coordinator(StoreKind::Log).state(),
            ReplicationState::Inactive
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.start_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_flushes_both_stores() {
        let (backend, engine) = backend();
        let mut events = backend.subscribe();
        let _reply = backend.handle_command(replicate_command()).unwrap();

        backend.cleanup().await;

        assert_eq!(backend.link_state(), LinkState::Cleanup);
        assert_eq!(engine.flush_count(), 2);
        for store in [StoreKind::Data, StoreKind::Log] {
            assert_eq!(
                backend.coordinator(store).state(),
                ReplicationState::Cleanup
            );
        }

        let mut saw_link_cleanup = false;
        while let Ok(event) = events.try_recv() {
            if event == BackendEvent::Link(LinkState::Cleanup) {
                saw_link_cleanup = true;
            }
        }
        assert!(saw_link_cleanup);
    }

    #[test]
    fn command_debug_hides_password() {
        let debug = format!("{:?}", replicate_command());
        assert!(debug.contains("station"));
        assert!(!debug.contains("secret"));
    }
}
