//! Loopback sync engine.
//!
//! Replicates between [`MemoryStore`]s in the same process. Remote stores are
//! registered under their normalized URL and may require credentials. Used
//! by the station binary for dry runs and by integration tests.

use crate::config::ReplicationOptions;
use crate::engine::{
    ReplicationEvent, ReplicationFeed, ReplicationHandle, ReplicationSummary, SyncEngine,
};
use crate::error::{SyncError, SyncResult};
use crate::memory::MemoryStore;
use crate::target::{normalize_remote_url, Credentials, RemoteTarget};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Attempts a `retry` one-shot run makes against an unknown target.
const DEFAULT_UNKNOWN_TARGET_ATTEMPTS: u32 = 3;

/// Pause between those attempts.
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct Remote {
    store: MemoryStore,
    credentials: Option<Credentials>,
}

#[derive(Default)]
struct LoopbackInner {
    remotes: RwLock<HashMap<String, Remote>>,
    checkpoints: Mutex<HashMap<(String, String), u64>>,
}

impl LoopbackInner {
    fn lookup(&self, target: &RemoteTarget) -> SyncResult<MemoryStore> {
        let remotes = self.remotes.read();
        let remote = remotes
            .get(target.url())
            .ok_or_else(|| SyncError::UnknownTarget(target.url().to_string()))?;

        match &remote.credentials {
            Some(required) if required != target.credentials() => Err(SyncError::Denied(
                format!("unauthorized for {}", target.url()),
            )),
            _ => Ok(remote.store.clone()),
        }
    }

    fn checkpoint(&self, key: &(String, String)) -> u64 {
        self.checkpoints.lock().get(key).copied().unwrap_or(0)
    }

    fn set_checkpoint(&self, key: &(String, String), seq: u64) {
        self.checkpoints.lock().insert(key.clone(), seq);
    }
}

/// A [`SyncEngine`] over in-process [`MemoryStore`]s.
///
/// Cloning is cheap; clones share registered remotes and checkpoints.
#[derive(Clone)]
pub struct LoopbackSyncEngine {
    inner: Arc<LoopbackInner>,
    unknown_target_attempts: u32,
}

impl LoopbackSyncEngine {
    /// Creates an engine with no remote stores.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LoopbackInner::default()),
            unknown_target_attempts: DEFAULT_UNKNOWN_TARGET_ATTEMPTS,
        }
    }

    /// Sets how often a `retry` one-shot run tries an unknown target.
    pub fn with_unknown_target_attempts(mut self, attempts: u32) -> Self {
        self.unknown_target_attempts = attempts.max(1);
        self
    }

    /// Registers a remote store that accepts any credentials.
    pub fn register_remote(&self, url: &str, store: MemoryStore) -> SyncResult<()> {
        self.insert_remote(url, store, None)
    }

    /// Registers a remote store that only accepts `credentials`.
    pub fn register_remote_with_credentials(
        &self,
        url: &str,
        store: MemoryStore,
        credentials: Credentials,
    ) -> SyncResult<()> {
        self.insert_remote(url, store, Some(credentials))
    }

    /// Removes a remote store, as if it went offline.
    pub fn unregister_remote(&self, url: &str) -> Option<MemoryStore> {
        let url = normalize_remote_url(url).ok()?;
        self.inner.remotes.write().remove(&url).map(|remote| remote.store)
    }

    /// Returns the store registered under `url`.
    pub fn remote(&self, url: &str) -> Option<MemoryStore> {
        let url = normalize_remote_url(url).ok()?;
        self.inner
            .remotes
            .read()
            .get(&url)
            .map(|remote| remote.store.clone())
    }

    fn insert_remote(
        &self,
        url: &str,
        store: MemoryStore,
        credentials: Option<Credentials>,
    ) -> SyncResult<()> {
        let url = normalize_remote_url(url)?;
        debug!(%url, store = store.name(), "registered remote store");
        self.inner
            .remotes
            .write()
            .insert(url, Remote { store, credentials });
        Ok(())
    }
}

impl Default for LoopbackSyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackSyncEngine")
            .field("remotes", &self.inner.remotes.read().len())
            .finish()
    }
}

impl SyncEngine for LoopbackSyncEngine {
    type Source = MemoryStore;
    type Target = RemoteTarget;

    fn start(
        &self,
        source: &MemoryStore,
        target: &RemoteTarget,
        options: ReplicationOptions,
    ) -> ReplicationHandle {
        let (handle, feed) = ReplicationHandle::channel();
        let run = Run {
            inner: Arc::clone(&self.inner),
            key: (source.name().to_string(), target.url().to_string()),
            source: source.clone(),
            target: target.clone(),
            options,
            feed,
            summary: ReplicationSummary::default(),
        };

        if options.live {
            tokio::spawn(run.live());
        } else {
            tokio::spawn(run.once(self.unknown_target_attempts));
        }
        handle
    }
}

struct Run {
    inner: Arc<LoopbackInner>,
    key: (String, String),
    source: MemoryStore,
    target: RemoteTarget,
    options: ReplicationOptions,
    feed: ReplicationFeed,
    summary: ReplicationSummary,
}

impl Run {
    async fn live(mut self) {
        let remote = match self.inner.lookup(&self.target) {
            Ok(remote) => remote,
            Err(err) if err.is_authorization() => {
                self.feed.emit(ReplicationEvent::Denied(err));
                self.feed.cancelled().await;
                self.complete(false);
                return;
            }
            Err(err) => {
                self.feed.emit(ReplicationEvent::Error(err));
                return;
            }
        };

        let mut active = false;
        while !self.feed.is_cancelled() {
            let checkpoint = self.inner.checkpoint(&self.key);
            if self.push_batch(&remote, checkpoint) {
                if !active {
                    active = true;
                    self.feed.emit(ReplicationEvent::Active);
                }
                tokio::task::yield_now().await;
                continue;
            }

            if active || self.summary.docs_read == 0 {
                active = false;
                self.feed.emit(ReplicationEvent::Paused(None));
            }

            let source = self.source.clone();
            let mut feed = self.feed.clone();
            tokio::select! {
                _ = feed.cancelled() => break,
                _ = source.wait_for_change(checkpoint) => {}
            }
        }

        self.complete(true);
    }

    async fn once(mut self, attempts: u32) {
        let mut attempt = 1;
        let remote = loop {
            match self.inner.lookup(&self.target) {
                Ok(remote) => break remote,
                Err(err) if err.is_retryable() && self.options.retry && attempt < attempts => {
                    debug!(error = %err, attempt, "retrying one-shot replication");
                    attempt += 1;
                    let mut feed = self.feed.clone();
                    tokio::select! {
                        _ = feed.cancelled() => {
                            self.complete(false);
                            return;
                        }
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
                Err(err) if err.is_authorization() => {
                    self.feed.emit(ReplicationEvent::Denied(err));
                    self.complete(false);
                    return;
                }
                Err(err) => {
                    self.feed.emit(ReplicationEvent::Error(err));
                    return;
                }
            }
        };

        self.feed.emit(ReplicationEvent::Active);
        loop {
            if self.feed.is_cancelled() {
                self.complete(false);
                return;
            }
            let checkpoint = self.inner.checkpoint(&self.key);
            if !self.push_batch(&remote, checkpoint) {
                break;
            }
            tokio::task::yield_now().await;
        }

        self.complete(true);
    }

    /// Copies one batch to `remote`. Returns false if there was nothing to
    /// copy.
    fn push_batch(&mut self, remote: &MemoryStore, checkpoint: u64) -> bool {
        let batch = self
            .source
            .changes_since(checkpoint, self.options.batch_size.max(1) as usize);
        let Some(last) = batch.last().map(|doc| doc.seq) else {
            return false;
        };

        for doc in batch {
            self.summary.docs_read += 1;
            remote.put(doc.id, doc.body);
            self.summary.docs_written += 1;
        }
        self.inner.set_checkpoint(&self.key, last);
        trace!(checkpoint = last, url = %self.target, "pushed batch");
        true
    }

    fn complete(mut self, ok: bool) {
        self.summary.ok = ok && self.summary.doc_write_failures == 0;
        let summary = std::mem::take(&mut self.summary);
        self.feed.emit(ReplicationEvent::Complete(summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(url: &str) -> RemoteTarget {
        RemoteTarget::new(normalize_remote_url(url).unwrap(), Credentials::none())
    }

    #[tokio::test]
    async fn one_shot_copies_everything() {
        let engine = LoopbackSyncEngine::new();
        let remote = MemoryStore::new("remote");
        engine.register_remote("http://gs.local/data", remote.clone()).unwrap();

        let local = MemoryStore::new("data");
        for n in 0..45 {
            local.insert(json!({ "n": n }));
        }

        let options = ReplicationOptions::one_shot().with_batch_size(10);
        let handle = engine.start(&local, &target("http://gs.local/data"), options);
        let summary = handle.finish().await.unwrap();

        assert!(summary.ok);
        assert_eq!(summary.docs_written, 45);
        assert_eq!(remote.len(), 45);
    }

    #[tokio::test]
    async fn checkpoints_skip_replicated_documents() {
        let engine = LoopbackSyncEngine::new();
        engine
            .register_remote("http://gs.local/data", MemoryStore::new("remote"))
            .unwrap();

        let local = MemoryStore::new("data");
        local.insert(json!(1));
        let t = target("http://gs.local/data");

        let first = engine.start(&local, &t, ReplicationOptions::one_shot());
        assert_eq!(first.finish().await.unwrap().docs_written, 1);

        local.insert(json!(2));
        let second = engine.start(&local, &t, ReplicationOptions::one_shot());
        assert_eq!(second.finish().await.unwrap().docs_written, 1);
    }

    #[tokio::test]
    async fn live_pushes_then_pauses_and_follows_changes() {
        let engine = LoopbackSyncEngine::new();
        let remote = MemoryStore::new("remote");
        engine.register_remote("http://gs.local/log", remote.clone()).unwrap();

        let local = MemoryStore::new("log");
        local.insert(json!("boot"));

        let t = target("http://gs.local/log");
        let mut handle = engine.start(&local, &t, ReplicationOptions::live());
        assert_eq!(handle.next_event().await, Some(ReplicationEvent::Active));
        assert_eq!(handle.next_event().await, Some(ReplicationEvent::Paused(None)));
        assert_eq!(remote.len(), 1);

        local.insert(json!("packet"));
        assert_eq!(handle.next_event().await, Some(ReplicationEvent::Active));
        assert_eq!(handle.next_event().await, Some(ReplicationEvent::Paused(None)));
        assert_eq!(remote.len(), 2);

        handle.cancel();
        match handle.next_event().await {
            Some(ReplicationEvent::Complete(summary)) => assert_eq!(summary.docs_written, 2),
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn live_with_empty_source_pauses() {
        let engine = LoopbackSyncEngine::new();
        engine
            .register_remote("http://gs.local/data", MemoryStore::new("remote"))
            .unwrap();

        let local = MemoryStore::new("data");
        let t = target("http://gs.local/data");
        let mut handle = engine.start(&local, &t, ReplicationOptions::live());
        assert_eq!(handle.next_event().await, Some(ReplicationEvent::Paused(None)));
    }

    #[tokio::test]
    async fn live_unknown_target_errors() {
        let engine = LoopbackSyncEngine::new();
        let local = MemoryStore::new("data");

        let t = target("http://nowhere/data");
        let mut handle = engine.start(&local, &t, ReplicationOptions::live());
        assert!(matches!(
            handle.next_event().await,
            Some(ReplicationEvent::Error(SyncError::UnknownTarget(_)))
        ));
    }

    #[tokio::test]
    async fn wrong_credentials_are_denied() {
        let engine = LoopbackSyncEngine::new();
        engine
            .register_remote_with_credentials(
                "https://gs.local/data",
                MemoryStore::new("remote"),
                Credentials::new("station", "secret"),
            )
            .unwrap();

        let local = MemoryStore::new("data");
        let bad = RemoteTarget::new(
            "https://gs.local:6984/data",
            Credentials::new("station", "nope"),
        );

        let mut handle = engine.start(&local, &bad, ReplicationOptions::live());
        assert!(matches!(
            handle.next_event().await,
            Some(ReplicationEvent::Denied(_))
        ));
        handle.cancel();
        assert!(matches!(
            handle.next_event().await,
            Some(ReplicationEvent::Complete(ReplicationSummary { ok: false, .. }))
        ));

        let once = engine.start(&local, &bad, ReplicationOptions::one_shot());
        assert!(!once.finish().await.unwrap().ok);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_one_shot_is_not_retried() {
        let engine = LoopbackSyncEngine::new();
        engine
            .register_remote_with_credentials(
                "https://gs.local/data",
                MemoryStore::new("remote"),
                Credentials::new("station", "secret"),
            )
            .unwrap();
        let bad = RemoteTarget::new(
            "https://gs.local:6984/data",
            Credentials::new("station", "nope"),
        );

        let started = tokio::time::Instant::now();
        let once = engine.start(&MemoryStore::new("data"), &bad, ReplicationOptions::one_shot());
        assert!(!once.finish().await.unwrap().ok);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_retries_unknown_target() {
        let engine = LoopbackSyncEngine::new().with_unknown_target_attempts(2);
        let local = MemoryStore::new("data");
        let t = target("http://late.local/data");

        let handle = engine.start(&local, &t, ReplicationOptions::one_shot());
        assert!(matches!(
            handle.finish().await,
            Err(SyncError::UnknownTarget(_))
        ));

        let handle = engine.start(&local, &t, ReplicationOptions::one_shot());
        engine
            .register_remote("http://late.local/data", MemoryStore::new("remote"))
            .unwrap();
        assert!(handle.finish().await.unwrap().ok);
    }

    #[test]
    fn remotes_are_normalized() {
        let engine = LoopbackSyncEngine::new();
        let store = MemoryStore::new("remote");
        engine.register_remote("http://gs.local/data", store).unwrap();

        assert!(engine.remote("http://gs.local:5984/data").is_some());
        assert!(engine.unregister_remote("http://gs.local/data").is_some());
        assert!(engine.remote("http://gs.local/data").is_none());
    }
}
