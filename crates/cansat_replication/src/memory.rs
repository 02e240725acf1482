//! In-memory document store.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Update sequence of the last write.
    pub seq: u64,
    /// Document body.
    pub body: Value,
}

#[derive(Default)]
struct Docs {
    by_id: BTreeMap<String, Document>,
    by_seq: BTreeMap<u64, String>,
    update_seq: u64,
}

struct StoreInner {
    name: String,
    docs: RwLock<Docs>,
    changed: Notify,
}

/// A named, thread-safe document store.
///
/// Every write bumps the update sequence. [`changes_since`] lists the
/// latest revision of each document changed after a given sequence, which
/// is what a replication reads.
///
/// [`changes_since`]: MemoryStore::changes_since
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                docs: RwLock::new(Docs::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Writes a document, replacing any earlier revision. Returns the new
    /// update sequence.
    pub fn put(&self, id: impl Into<String>, body: Value) -> u64 {
        let id = id.into();
        let seq = {
            let mut docs = self.inner.docs.write();
            docs.update_seq += 1;
            let seq = docs.update_seq;

            if let Some(previous) = docs.by_id.get(&id).map(|doc| doc.seq) {
                docs.by_seq.remove(&previous);
            }
            docs.by_seq.insert(seq, id.clone());
            docs.by_id.insert(id.clone(), Document { id, seq, body });
            seq
        };

        self.inner.changed.notify_waiters();
        seq
    }

    /// Writes a document under a fresh random id and returns the id.
    pub fn insert(&self, body: Value) -> String {
        let id = Uuid::new_v4().to_string();
        self.put(id.clone(), body);
        id
    }

    /// Returns a document body.
    pub fn get(&self, id: &str) -> Option<Value> {
        self.inner.docs.read().by_id.get(id).map(|doc| doc.body.clone())
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.inner.docs.read().by_id.len()
    }

    /// Returns true if the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence of the most recent write. Zero for a fresh store.
    pub fn update_seq(&self) -> u64 {
        self.inner.docs.read().update_seq
    }

    /// Up to `limit` documents written after `since`, oldest first.
    pub fn changes_since(&self, since: u64, limit: usize) -> Vec<Document> {
        let docs = self.inner.docs.read();
        docs.by_seq
            .range(since.saturating_add(1)..)
            .take(limit)
            .filter_map(|(_, id)| docs.by_id.get(id).cloned())
            .collect()
    }

    /// All documents, ordered by id.
    pub fn documents(&self) -> Vec<Document> {
        self.inner.docs.read().by_id.values().cloned().collect()
    }

    /// Waits until the update sequence moves past `since`.
    pub async fn wait_for_change(&self, since: u64) {
        loop {
            let notified = self.inner.changed.notified();
            if self.update_seq() > since {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let docs = self.inner.docs.read();
        f.debug_struct("MemoryStore")
            .field("name", &self.inner.name)
            .field("docs", &docs.by_id.len())
            .field("update_seq", &docs.update_seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn put_and_get() {
        let store = MemoryStore::new("data");
        assert!(store.is_empty());

        assert_eq!(store.put("a", json!({"alt": 120})), 1);
        assert_eq!(store.get("a"), Some(json!({"alt": 120})));
        assert_eq!(store.get("b"), None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.name(), "data");
    }

    #[test]
    fn insert_generates_ids() {
        let store = MemoryStore::new("data");
        let a = store.insert(json!({"n": 1}));
        let b = store.insert(json!({"n": 2}));

        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
        assert_eq!(store.update_seq(), 2);
    }

    #[test]
    fn changes_list_latest_revision_once() {
        let store = MemoryStore::new("data");
        store.put("a", json!(1));
        store.put("b", json!(2));
        store.put("a", json!(3));

        let changes = store.changes_since(0, 10);
        let ids: Vec<_> = changes.iter().map(|doc| doc.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(changes[1].body, json!(3));
        assert_eq!(changes[1].seq, 3);

        assert_eq!(store.changes_since(2, 10).len(), 1);
        assert_eq!(store.changes_since(0, 1).len(), 1);
        assert!(store.changes_since(3, 10).is_empty());
    }

    #[test]
    fn clones_share_documents() {
        let store = MemoryStore::new("log");
        let other = store.clone();
        other.put("x", json!("hello"));

        assert_eq!(store.get("x"), Some(json!("hello")));
        assert_eq!(store.documents().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_change_wakes_on_write() {
        let store = MemoryStore::new("data");
        let writer = store.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.put("late", json!(true));
        });

        store.wait_for_change(0).await;
        assert_eq!(store.update_seq(), 1);

        // Already past the sequence: returns immediately.
        store.wait_for_change(0).await;
    }
}
