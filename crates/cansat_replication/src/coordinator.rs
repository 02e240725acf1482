//! Replication coordinator.
//!
//! A [`Coordinator`] keeps one live replication from a fixed source store to
//! a replaceable target alive. It restarts failed streams through a
//! [`BackoffScheduler`], never runs two streams at once, and performs one
//! best-effort one-shot flush when cleaned up.
//!
//! All state lives in a driver task. The public handle only sends commands
//! to it, so API calls, stream events and backoff timers are processed one
//! at a time in arrival order.

use crate::backoff::{BackoffEvent, BackoffScheduler};
use crate::config::{CoordinatorConfig, ReplicationOptions};
use crate::engine::{ReplicationEvent, ReplicationHandle, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::target::{Credentials, TargetResolver};
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn, Instrument, Span};

/// Externally visible coordinator state.
///
/// Backoff waiting is folded into [`Connecting`](Self::Connecting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationState {
    /// Not replicating.
    Inactive,
    /// Trying to (re)establish a stream, possibly waiting for a retry.
    Connecting,
    /// Changes are being transferred.
    Active,
    /// The stream is up but idle.
    Pause,
    /// Shutting down. Never left.
    Cleanup,
}

impl ReplicationState {
    /// Lowercase name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationState::Inactive => "inactive",
            ReplicationState::Connecting => "connecting",
            ReplicationState::Active => "active",
            ReplicationState::Pause => "pause",
            ReplicationState::Cleanup => "cleanup",
        }
    }

    /// Returns true for the states of an established stream.
    pub fn is_connected(&self) -> bool {
        matches!(self, ReplicationState::Active | ReplicationState::Pause)
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a [`replicate`](Coordinator::replicate) call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicateOutcome {
    /// The stream became active or cleanly paused.
    Connected,
    /// A later `replicate()` call took over.
    Superseded,
    /// `stop()` was called, or the coordinator went away.
    Stopped,
    /// The coordinator is cleaning up.
    ShuttingDown,
}

impl ReplicateOutcome {
    /// Returns true if the stream connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, ReplicateOutcome::Connected)
    }
}

/// Future returned by [`Coordinator::replicate`].
///
/// Resolves once: on the first successful connection, or when the call is
/// superseded, stopped or cut short by cleanup.
#[derive(Debug)]
#[must_use = "dropping the future does not cancel the replication"]
pub struct PendingReplication {
    inner: PendingInner,
}

#[derive(Debug)]
enum PendingInner {
    Ready(Option<ReplicateOutcome>),
    Waiting(oneshot::Receiver<ReplicateOutcome>),
}

impl PendingReplication {
    fn ready(outcome: ReplicateOutcome) -> Self {
        Self {
            inner: PendingInner::Ready(Some(outcome)),
        }
    }

    fn waiting(rx: oneshot::Receiver<ReplicateOutcome>) -> Self {
        Self {
            inner: PendingInner::Waiting(rx),
        }
    }
}

impl Future for PendingReplication {
    type Output = ReplicateOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            PendingInner::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(ReplicateOutcome::Stopped))
            }
            PendingInner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(ReplicateOutcome::Stopped)),
        }
    }
}

enum Command<T> {
    Replicate {
        target: T,
        done: oneshot::Sender<ReplicateOutcome>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    Cleanup {
        done: oneshot::Sender<()>,
    },
}

struct Shared {
    state: RwLock<ReplicationState>,
    states: broadcast::Sender<ReplicationState>,
}

/// Keeps a replication stream alive.
///
/// Construction spawns the driver task, so it must happen inside a Tokio
/// runtime. Dropping every handle stops the driver and cancels the stream.
pub struct Coordinator<E: SyncEngine, R> {
    name: Arc<str>,
    resolver: R,
    commands: mpsc::UnboundedSender<Command<E::Target>>,
    shared: Arc<Shared>,
    scheduler: BackoffScheduler,
    span: Span,
}

impl<E, R> Coordinator<E, R>
where
    E: SyncEngine,
    R: TargetResolver<Target = E::Target>,
{
    /// Creates a coordinator replicating from `source` and starts its driver.
    pub fn new(
        name: impl Into<String>,
        source: E::Source,
        engine: E,
        resolver: R,
        config: CoordinatorConfig,
    ) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let span = tracing::info_span!("replicator", store = %name);

        let (states, _) = broadcast::channel(config.state_channel_capacity.max(1));
        let shared = Arc::new(Shared {
            state: RwLock::new(ReplicationState::Inactive),
            states,
        });

        let scheduler = BackoffScheduler::new(config.backoff.clone());
        let backoff_events = scheduler.subscribe();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            source,
            engine,
            config,
            shared: Arc::clone(&shared),
            scheduler: scheduler.clone(),
            target: None,
            handle: None,
            waiter: None,
            cleaned_up: false,
        };
        tokio::spawn(driver.run(command_rx, backoff_events).instrument(span.clone()));

        Self {
            name,
            resolver,
            commands,
            shared,
            scheduler,
            span,
        }
    }

    /// Starts live replication to `target`, superseding any earlier call.
    ///
    /// Returns an error only if the target cannot be resolved. The returned
    /// future resolves with [`ReplicateOutcome::Connected`] the first time
    /// the stream becomes active or cleanly paused. During cleanup the call
    /// has no effect and resolves with [`ReplicateOutcome::ShuttingDown`].
    pub fn replicate(
        &self,
        target: &str,
        credentials: &Credentials,
    ) -> SyncResult<PendingReplication> {
        let resolved = {
            let _enter = self.span.enter();
            if self.state() == ReplicationState::Cleanup {
                debug!(url = target, "ignoring replicate during cleanup");
                return Ok(PendingReplication::ready(ReplicateOutcome::ShuttingDown));
            }
            let resolved = self.resolve(target, credentials)?;
            info!(
                url = target,
                username = credentials.username().unwrap_or_default(),
                "live replication triggered"
            );
            resolved
        };
        Ok(self.replicate_resolved(resolved))
    }

    /// Resolves `target` with this coordinator's resolver without starting
    /// anything.
    pub fn resolve(&self, target: &str, credentials: &Credentials) -> SyncResult<E::Target> {
        self.resolver.resolve(target, credentials)
    }

    /// Like [`replicate`](Self::replicate), for a target that is already
    /// resolved.
    pub fn replicate_resolved(&self, target: E::Target) -> PendingReplication {
        let _enter = self.span.enter();
        if self.state() == ReplicationState::Cleanup {
            debug!("ignoring replicate during cleanup");
            return PendingReplication::ready(ReplicateOutcome::ShuttingDown);
        }

        let (done, rx) = oneshot::channel();
        // A closed driver drops `done`, which resolves the future as stopped.
        let _ = self.commands.send(Command::Replicate { target, done });
        PendingReplication::waiting(rx)
    }

    /// Cancels the stream and resets the backoff. Idempotent.
    ///
    /// The state becomes [`Inactive`](ReplicationState::Inactive) unless the
    /// coordinator is already cleaning up.
    pub async fn stop(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stops replication and attempts one final one-shot flush.
    ///
    /// Always completes. Flush failures are logged, and the flush is bounded
    /// by [`CoordinatorConfig::flush_timeout`]. Only the first call flushes.
    pub async fn cleanup(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Cleanup { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Current state.
    pub fn state(&self) -> ReplicationState {
        *self.shared.state.read()
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationState> {
        self.shared.states.subscribe()
    }

    /// The scheduler pacing restarts.
    pub fn backoff(&self) -> &BackoffScheduler {
        &self.scheduler
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<E: SyncEngine, R> fmt::Debug for Coordinator<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("name", &self.name)
            .field("state", &*self.shared.state.read())
            .field("backoff", &self.scheduler)
            .finish()
    }
}

enum Wake<T> {
    Command(Command<T>),
    Backoff(BackoffEvent),
    Stream(Option<ReplicationEvent>),
}

struct Driver<E: SyncEngine> {
    source: E::Source,
    engine: E,
    config: CoordinatorConfig,
    shared: Arc<Shared>,
    scheduler: BackoffScheduler,
    target: Option<E::Target>,
    handle: Option<ReplicationHandle>,
    waiter: Option<oneshot::Sender<ReplicateOutcome>>,
    cleaned_up: bool,
}

impl<E: SyncEngine> Driver<E> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<E::Target>>,
        mut backoff: mpsc::UnboundedReceiver<BackoffEvent>,
    ) {
        loop {
            let wake = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => break,
                },
                Some(event) = backoff.recv() => Wake::Backoff(event),
                event = next_stream_event(&mut self.handle) => Wake::Stream(event),
            };

            match wake {
                Wake::Command(command) => self.on_command(command).await,
                Wake::Backoff(event) => self.on_backoff(event),
                Wake::Stream(event) => self.on_stream_event(event),
            }
        }

        self.drop_handle();
        self.scheduler.reset();
        debug!("coordinator dropped");
    }

    fn state(&self) -> ReplicationState {
        *self.shared.state.read()
    }

    async fn on_command(&mut self, command: Command<E::Target>) {
        match command {
            Command::Replicate { target, done } => {
                if self.state() == ReplicationState::Cleanup {
                    let _ = done.send(ReplicateOutcome::ShuttingDown);
                    return;
                }

                self.stop(ReplicateOutcome::Superseded);
                self.target = Some(target);
                self.waiter = Some(done);
                self.set_state(ReplicationState::Connecting, None);
                self.scheduler.schedule_backoff();
            }
            Command::Stop { done } => {
                self.stop(ReplicateOutcome::Stopped);
                let _ = done.send(());
            }
            Command::Cleanup { done } => {
                if !self.cleaned_up {
                    self.cleaned_up = true;
                    self.cleanup().await;
                }
                let _ = done.send(());
            }
        }
    }

    fn on_backoff(&mut self, event: BackoffEvent) {
        match event {
            BackoffEvent::Waiting { attempt, delay } => {
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off from replication"
                );
            }
            BackoffEvent::Retry {
                attempt,
                generation,
            } => {
                if generation != self.scheduler.generation() {
                    debug!(attempt, "ignoring stale retry");
                    return;
                }
                self.ensure_replication(attempt);
            }
            BackoffEvent::Succeeded => {
                debug!("replication connected");
            }
        }
    }

    fn on_stream_event(&mut self, event: Option<ReplicationEvent>) {
        match event {
            Some(ReplicationEvent::Active) => {
                self.connected();
                self.set_state(ReplicationState::Active, None);
            }
            Some(ReplicationEvent::Paused(None)) => {
                self.connected();
                self.set_state(ReplicationState::Pause, None);
            }
            Some(ReplicationEvent::Paused(Some(err))) => {
                self.set_state(ReplicationState::Pause, Some(&err));
            }
            Some(ReplicationEvent::Denied(err)) if err.is_authorization() => {
                error!(error = %err, "replication denied, check the backend credentials");
            }
            Some(ReplicationEvent::Denied(err)) => {
                error!(error = %err, "replication denied");
            }
            Some(ReplicationEvent::Error(err)) => {
                warn!(error = %err, retryable = err.is_retryable(), "replication error");
                self.restart_later();
            }
            Some(ReplicationEvent::Complete(summary)) => {
                warn!(
                    ok = summary.ok,
                    docs_written = summary.docs_written,
                    "replication cancelled or completed"
                );
                self.restart_later();
            }
            None => {
                warn!("replication stream closed");
                self.restart_later();
            }
        }
    }

    /// Opens a fresh stream unless a stop, cleanup or missing target says
    /// otherwise.
    fn ensure_replication(&mut self, attempt: u32) {
        let state = self.state();
        if matches!(
            state,
            ReplicationState::Inactive | ReplicationState::Cleanup
        ) {
            debug!(attempt, %state, "not restarting replication");
            return;
        }
        if self.target.is_none() {
            debug!(attempt, "no target to replicate to");
            return;
        }

        self.drop_handle();
        info!(attempt, "attempting replication");
        self.set_state(ReplicationState::Connecting, None);
        if let Some(target) = self.target.as_ref() {
            self.handle = Some(
                self.engine
                    .start(&self.source, target, self.config.live_options),
            );
        }
    }

    fn connected(&mut self) {
        self.scheduler.success();
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(ReplicateOutcome::Connected);
        }
    }

    fn restart_later(&mut self) {
        self.drop_handle();
        self.set_state(ReplicationState::Connecting, None);
        self.scheduler.schedule_backoff();
    }

    /// Detaches before cancelling so the engine's cancellation events are
    /// never mistaken for failures.
    fn drop_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.detach();
            handle.cancel();
        }
    }

    fn stop(&mut self, outcome: ReplicateOutcome) {
        info!("stopping replication");
        self.drop_handle();
        self.scheduler.reset();

        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(outcome);
        }
        if self.state() != ReplicationState::Cleanup {
            self.set_state(ReplicationState::Inactive, None);
        }
    }

    async fn cleanup(&mut self) {
        self.stop(ReplicateOutcome::ShuttingDown);
        info!("cleanup");
        self.set_state(ReplicationState::Cleanup, None);

        let Some(target) = self.target.as_ref() else {
            info!("no target, skipping last-minute replication");
            return;
        };

        let options = ReplicationOptions {
            live: false,
            ..self.config.flush_options
        };
        let handle = self.engine.start(&self.source, target, options);
        let timeout = self.config.flush_timeout;

        match tokio::time::timeout(timeout, handle.finish()).await {
            Ok(Ok(summary)) if summary.ok => {
                info!(
                    docs_written = summary.docs_written,
                    "last minute replication successful"
                );
            }
            Ok(Ok(summary)) => {
                warn!(
                    docs_written = summary.docs_written,
                    doc_write_failures = summary.doc_write_failures,
                    "last minute replication failed"
                );
            }
            Ok(Err(err)) => {
                warn!(error = %err, "error in last-minute replication");
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    error = %SyncError::Timeout,
                    "last minute replication timed out"
                );
            }
        }
    }

    /// Records a new state and notifies subscribers if it changed.
    ///
    /// Flips between active and pause are logged only when entering them
    /// from another state or when an error comes with them.
    ///
    /// Subscribers see every change. A repeated state is sent again when an
    /// error comes with it or when it is `Connecting`, which always marks a
    /// new connection attempt.
    fn set_state(&mut self, next: ReplicationState, err: Option<&SyncError>) {
        let previous = std::mem::replace(&mut *self.shared.state.write(), next);

        let flip = next.is_connected() && previous.is_connected();
        match err {
            Some(err) => warn!(state = %next, error = %err, "update state"),
            None if !flip => info!(state = %next, "update state"),
            None => {}
        }

        if previous != next || err.is_some() || next == ReplicationState::Connecting {
            let _ = self.shared.states.send(next);
        }
    }
}

async fn next_stream_event(handle: &mut Option<ReplicationHandle>) -> Option<ReplicationEvent> {
    match handle {
        Some(handle) => handle.next_event().await,
        None => std::future::pending().await,
    }
}
