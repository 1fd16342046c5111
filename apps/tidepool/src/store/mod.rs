//! Document store collaborator.
//!
//! The node only needs a narrow surface from storage: CRUD for the command
//! loop, a live change stream to trigger replication, a batched replication
//! primitive bound to a peer data channel, and compaction.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::identity::PeerId;
use crate::protocol::Frame;
use crate::transport::{DataChannel, TransportError};

pub mod memory;
pub mod stream;

pub use memory::MemoryStore;
pub use stream::StreamReplicator;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0:?} not found")]
    NotFound(String),
    #[error("invalid document id")]
    InvalidId,
    #[error("replication frame could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("unexpected binary replication frame")]
    UnexpectedBinary,
    #[error("replication transport failed: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub rev: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub body: Value,
}

impl Document {
    /// Total order used to settle concurrent writes: revision first, then a
    /// tombstone beats a live body, then the greater serialized body.
    pub fn precedence(&self, other: &Document) -> Ordering {
        self.rev
            .cmp(&other.rev)
            .then(self.deleted.cmp(&other.deleted))
            .then_with(|| self.body.to_string().cmp(&other.body.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub document: Document,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub reclaimed: usize,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError>;

    async fn put(&self, id: &str, body: Value) -> Result<Document, StoreError>;

    async fn remove(&self, id: &str) -> Result<Document, StoreError>;

    /// Every current revision, tombstones included.
    async fn documents(&self) -> Result<Vec<Document>, StoreError>;

    /// Merges a revision received from a peer. Returns whether it won.
    async fn merge(&self, document: Document) -> Result<bool, StoreError>;

    async fn compact(&self) -> Result<CompactionReport, StoreError>;

    fn changes(&self) -> broadcast::Receiver<Change>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub documents: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Applied { documents: usize, accepted: usize },
    /// The peer finished pushing its replica to us.
    EndPeerReplicate,
}

/// Replication primitive bound to one peer data channel at a time.
#[async_trait]
pub trait Replicator: Send + Sync {
    async fn push(
        &self,
        channel: Arc<dyn DataChannel>,
        batch_size: usize,
    ) -> Result<PushReport, StoreError>;

    /// Applies one replication frame received from `peer`.
    async fn apply(&self, peer: &PeerId, frame: &Frame) -> Result<Inbound, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(rev: u64, deleted: bool, body: Value) -> Document {
        Document {
            id: "a".into(),
            rev,
            deleted,
            body,
        }
    }

    #[test_timeout::timeout]
    fn higher_revision_wins() {
        assert_eq!(
            doc(2, false, json!(1)).precedence(&doc(1, true, json!(9))),
            Ordering::Greater
        );
    }

    #[test_timeout::timeout]
    fn ties_break_on_tombstone_then_body() {
        assert_eq!(
            doc(3, true, json!(null)).precedence(&doc(3, false, json!("z"))),
            Ordering::Greater
        );
        assert_eq!(
            doc(3, false, json!("a")).precedence(&doc(3, false, json!("b"))),
            Ordering::Less
        );
        assert_eq!(
            doc(3, false, json!("a")).precedence(&doc(3, false, json!("a"))),
            Ordering::Equal
        );
    }
}
