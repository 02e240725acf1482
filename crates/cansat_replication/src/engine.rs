//! Sync engine abstraction.
//!
//! A [`SyncEngine`] starts replications from a source store to a target
//! store. Each start returns a [`ReplicationHandle`]: the receiving end of a
//! lifecycle event stream plus a cancellation switch. The engine keeps the
//! matching [`ReplicationFeed`] and pushes events into it.

use crate::config::ReplicationOptions;
use crate::error::{SyncError, SyncResult};
use crate::target::RemoteTarget;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

/// Lifecycle events of a running replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// Changes are being transferred.
    Active,
    /// Replication is idle. `None` means caught up; `Some` carries the
    /// error that made it stall.
    Paused(Option<SyncError>),
    /// The remote rejected a write or our credentials.
    Denied(SyncError),
    /// The replication failed. Emitted at most once.
    Error(SyncError),
    /// The replication finished or was cancelled. Emitted at most once.
    Complete(ReplicationSummary),
}

/// Counters reported when a replication completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationSummary {
    /// Whether every document made it to the target.
    pub ok: bool,
    /// Documents read from the source.
    pub docs_read: u64,
    /// Documents written to the target.
    pub docs_written: u64,
    /// Documents the target refused.
    pub doc_write_failures: u64,
}

/// Coordinator-side end of a replication.
///
/// Dropping the handle detaches it and cancels the replication.
#[derive(Debug)]
pub struct ReplicationHandle {
    events: Option<mpsc::UnboundedReceiver<ReplicationEvent>>,
    cancel: watch::Sender<bool>,
}

/// Engine-side end of a replication.
#[derive(Debug, Clone)]
pub struct ReplicationFeed {
    events: mpsc::UnboundedSender<ReplicationEvent>,
    cancel: watch::Receiver<bool>,
}

impl ReplicationHandle {
    /// Creates a connected handle/feed pair.
    pub fn channel() -> (ReplicationHandle, ReplicationFeed) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        (
            ReplicationHandle {
                events: Some(events_rx),
                cancel: cancel_tx,
            },
            ReplicationFeed {
                events: events_tx,
                cancel: cancel_rx,
            },
        )
    }

    /// Waits for the next lifecycle event.
    ///
    /// Returns `None` once the handle is detached or the engine dropped
    /// every feed.
    pub async fn next_event(&mut self) -> Option<ReplicationEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Stops listening. Events emitted afterwards are discarded.
    pub fn detach(&mut self) {
        self.events = None;
    }

    /// Returns true if the handle no longer listens for events.
    pub fn is_detached(&self) -> bool {
        self.events.is_none()
    }

    /// Asks the engine to stop the replication.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Returns true if [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Drives a one-shot replication to its end.
    ///
    /// `Active`, `Paused` and `Denied` are progress; `Complete` yields the
    /// summary and `Error` the failure.
    pub async fn finish(mut self) -> SyncResult<ReplicationSummary> {
        let mut denied = None;
        loop {
            match self.next_event().await {
                Some(ReplicationEvent::Complete(summary)) => return Ok(summary),
                Some(ReplicationEvent::Error(err)) => return Err(err),
                Some(ReplicationEvent::Denied(err)) => {
                    tracing::debug!(error = %err, "write denied during one-shot replication");
                    denied = Some(err);
                }
                Some(_) => {}
                None => return Err(denied.unwrap_or(SyncError::StreamClosed)),
            }
        }
    }
}

impl ReplicationFeed {
    /// Emits a lifecycle event. Returns false if nobody listens anymore.
    pub fn emit(&self, event: ReplicationEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Returns true once the handle was cancelled or dropped.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.cancel.has_changed().is_err()
    }

    /// Returns true once the handle stopped listening.
    pub fn is_detached(&self) -> bool {
        self.events.is_closed()
    }

    /// Resolves when the handle is cancelled or dropped.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.cancel.borrow_and_update() {
                return;
            }
            if self.cancel.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A sync engine replicates a source store to a target store.
///
/// `start` must not block; the replication runs in the background and
/// reports through the returned handle.
pub trait SyncEngine: Send + Sync + 'static {
    /// Local store replicated from.
    type Source: Send + Sync + 'static;
    /// Remote store replicated to.
    type Target: Send + Sync + 'static;

    /// Starts a replication.
    fn start(
        &self,
        source: &Self::Source,
        target: &Self::Target,
        options: ReplicationOptions,
    ) -> ReplicationHandle;
}

impl<E: SyncEngine> SyncEngine for Arc<E> {
    type Source = E::Source;
    type Target = E::Target;

    fn start(
        &self,
        source: &Self::Source,
        target: &Self::Target,
        options: ReplicationOptions,
    ) -> ReplicationHandle {
        (**self).start(source, target, options)
    }
}

/// A replication started on a [`MockSyncEngine`].
#[derive(Debug, Clone)]
pub struct MockStart {
    /// Source store name.
    pub source: String,
    /// Target the replication was started against.
    pub target: RemoteTarget,
    /// Options passed by the caller.
    pub options: ReplicationOptions,
    /// Engine-side feed, used to emit events.
    pub feed: ReplicationFeed,
}

/// What a mock one-shot replication reports.
#[derive(Debug, Clone)]
pub enum MockFlush {
    /// Complete with the given summary.
    Complete(ReplicationSummary),
    /// Fail with the given error.
    Fail(SyncError),
    /// Never report anything.
    Hang,
}

/// A mock sync engine for testing.
///
/// Live starts are recorded and stay silent until a test emits events
/// through [`emit`](Self::emit). One-shot starts answer according to
/// [`set_flush`](Self::set_flush).
#[derive(Debug)]
pub struct MockSyncEngine {
    starts: Mutex<Vec<MockStart>>,
    flush: Mutex<MockFlush>,
    started: Notify,
}

impl MockSyncEngine {
    /// Creates a mock engine whose flushes succeed.
    pub fn new() -> Self {
        Self {
            starts: Mutex::new(Vec::new()),
            flush: Mutex::new(MockFlush::Complete(ReplicationSummary {
                ok: true,
                ..ReplicationSummary::default()
            })),
            started: Notify::new(),
        }
    }

    /// Sets the behavior of one-shot replications.
    pub fn set_flush(&self, flush: MockFlush) {
        *self.flush.lock() = flush;
    }

    /// All recorded starts, oldest first.
    pub fn starts(&self) -> Vec<MockStart> {
        self.starts.lock().clone()
    }

    /// Number of recorded starts.
    pub fn start_count(&self) -> usize {
        self.starts.lock().len()
    }

    /// Number of live starts.
    pub fn live_start_count(&self) -> usize {
        self.starts.lock().iter().filter(|s| s.options.live).count()
    }

    /// Number of one-shot starts.
    pub fn flush_count(&self) -> usize {
        self.starts.lock().iter().filter(|s| !s.options.live).count()
    }

    /// Live replications whose handle was neither cancelled nor dropped.
    pub fn live_handles(&self) -> usize {
        self.starts
            .lock()
            .iter()
            .filter(|s| s.options.live && !s.feed.is_cancelled())
            .count()
    }

    /// Returns the start at `index`.
    pub fn start_at(&self, index: usize) -> Option<MockStart> {
        self.starts.lock().get(index).cloned()
    }

    /// Emits an event on the replication started at `index`.
    ///
    /// Returns false if there is no such start or nobody listens.
    pub fn emit(&self, index: usize, event: ReplicationEvent) -> bool {
        match self.starts.lock().get(index) {
            Some(start) => start.feed.emit(event),
            None => false,
        }
    }

    /// Drops the engine side of the replication at `index`, closing its
    /// event stream without a terminal event.
    pub fn close(&self, index: usize) -> bool {
        let mut starts = self.starts.lock();
        let Some(start) = starts.get_mut(index) else {
            return false;
        };
        let (_, detached) = ReplicationHandle::channel();
        start.feed = detached;
        true
    }

    /// Emits an event on the most recent start.
    pub fn emit_last(&self, event: ReplicationEvent) -> bool {
        match self.starts.lock().last() {
            Some(start) => start.feed.emit(event),
            None => false,
        }
    }

    /// Waits until at least `count` replications were started.
    pub async fn wait_for_starts(&self, count: usize) {
        loop {
            let notified = self.started.notified();
            if self.start_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl Default for MockSyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngine for MockSyncEngine {
    type Source = String;
    type Target = RemoteTarget;

    fn start(
        &self,
        source: &String,
        target: &RemoteTarget,
        options: ReplicationOptions,
    ) -> ReplicationHandle {
        let (handle, feed) = ReplicationHandle::channel();

        if !options.live {
            match &*self.flush.lock() {
                MockFlush::Complete(summary) => {
                    feed.emit(ReplicationEvent::Active);
                    feed.emit(ReplicationEvent::Complete(summary.clone()));
                }
                MockFlush::Fail(err) => {
                    feed.emit(ReplicationEvent::Error(err.clone()));
                }
                MockFlush::Hang => {}
            }
        }

        self.starts.lock().push(MockStart {
            source: source.clone(),
            target: target.clone(),
            options,
            feed,
        });
        self.started.notify_waiters();

        handle
    }
}
