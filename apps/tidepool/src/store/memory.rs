use std::cmp::Ordering as Precedence;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Change, ChangeOrigin, CompactionReport, Document, DocumentStore, StoreError};

const CHANGE_CAPACITY: usize = 1024;

/// Revisioned in-memory store. Overwritten revisions are kept until the next
/// compaction.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    changes: broadcast::Sender<Change>,
    compactions: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    documents: BTreeMap<String, Document>,
    superseded: Vec<Document>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            changes,
            compactions: AtomicUsize::new(0),
        }
    }

    /// Completed compactions since creation.
    pub fn compactions(&self) -> usize {
        self.compactions.load(Ordering::SeqCst)
    }

    pub fn superseded(&self) -> usize {
        self.inner.read().superseded.len()
    }

    /// Live (non-deleted) documents, ordered by id.
    pub fn live(&self) -> Vec<Document> {
        self.inner
            .read()
            .documents
            .values()
            .filter(|document| !document.deleted)
            .cloned()
            .collect()
    }

    fn write(&self, id: &str, body: Value, deleted: bool) -> Document {
        let document = {
            let mut inner = self.inner.write();
            let previous = inner.documents.get(id).cloned();
            let document = Document {
                id: id.to_string(),
                rev: previous.as_ref().map_or(1, |doc| doc.rev + 1),
                deleted,
                body,
            };
            if let Some(previous) = previous {
                inner.superseded.push(previous);
            }
            inner.documents.insert(id.to_string(), document.clone());
            document
        };
        let _ = self.changes.send(Change {
            document: document.clone(),
            origin: ChangeOrigin::Local,
        });
        document
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .inner
            .read()
            .documents
            .get(id)
            .filter(|document| !document.deleted)
            .cloned())
    }

    async fn put(&self, id: &str, body: Value) -> Result<Document, StoreError> {
        if id.trim().is_empty() {
            return Err(StoreError::InvalidId);
        }
        Ok(self.write(id, body, false))
    }

    async fn remove(&self, id: &str) -> Result<Document, StoreError> {
        let live = self
            .inner
            .read()
            .documents
            .get(id)
            .is_some_and(|document| !document.deleted);
        if !live {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(self.write(id, Value::Null, true))
    }

    async fn documents(&self) -> Result<Vec<Document>, StoreError> {
        Ok(self.inner.read().documents.values().cloned().collect())
    }

    async fn merge(&self, document: Document) -> Result<bool, StoreError> {
        if document.id.trim().is_empty() {
            return Err(StoreError::InvalidId);
        }
        {
            let mut inner = self.inner.write();
            let wins = inner
                .documents
                .get(&document.id)
                .is_none_or(|current| document.precedence(current) == Precedence::Greater);
            if !wins {
                return Ok(false);
            }
            if let Some(previous) = inner
                .documents
                .insert(document.id.clone(), document.clone())
            {
                inner.superseded.push(previous);
            }
        }
        let _ = self.changes.send(Change {
            document,
            origin: ChangeOrigin::Remote,
        });
        Ok(true)
    }

    async fn compact(&self) -> Result<CompactionReport, StoreError> {
        let reclaimed = {
            let mut inner = self.inner.write();
            std::mem::take(&mut inner.superseded).len()
        };
        self.compactions.fetch_add(1, Ordering::SeqCst);
        debug!(target = "replication", reclaimed, "store compacted");
        Ok(CompactionReport { reclaimed })
    }

    fn changes(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }
}
