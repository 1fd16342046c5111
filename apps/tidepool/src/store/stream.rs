use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Document, DocumentStore, Inbound, PushReport, Replicator, StoreError};
use crate::identity::PeerId;
use crate::protocol::Frame;
use crate::transport::DataChannel;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum StreamFrame {
    Batch { docs: Vec<Document> },
    End { count: usize },
}

/// Pushes the whole replica as JSON batch frames followed by an end frame.
#[derive(Clone)]
pub struct StreamReplicator {
    store: Arc<dyn DocumentStore>,
}

impl StreamReplicator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Replicator for StreamReplicator {
    async fn push(
        &self,
        channel: Arc<dyn DataChannel>,
        batch_size: usize,
    ) -> Result<PushReport, StoreError> {
        let documents = self.store.documents().await?;
        let mut report = PushReport {
            documents: documents.len(),
            batches: 0,
        };
        for chunk in documents.chunks(batch_size.max(1)) {
            let frame = StreamFrame::Batch {
                docs: chunk.to_vec(),
            };
            channel
                .send(Frame::Text(serde_json::to_string(&frame)?))
                .await?;
            report.batches += 1;
        }
        let end = StreamFrame::End {
            count: report.documents,
        };
        channel.send(Frame::Text(serde_json::to_string(&end)?)).await?;
        debug!(
            target = "replication",
            documents = report.documents,
            batches = report.batches,
            "replica pushed"
        );
        Ok(report)
    }

    async fn apply(&self, peer: &PeerId, frame: &Frame) -> Result<Inbound, StoreError> {
        let Frame::Text(text) = frame else {
            return Err(StoreError::UnexpectedBinary);
        };
        match serde_json::from_str::<StreamFrame>(text)? {
            StreamFrame::Batch { docs } => {
                let documents = docs.len();
                let mut accepted = 0;
                for document in docs {
                    if self.store.merge(document).await? {
                        accepted += 1;
                    }
                }
                trace!(target = "replication", peer = %peer, documents, accepted, "batch applied");
                Ok(Inbound::Applied {
                    documents,
                    accepted,
                })
            }
            StreamFrame::End { count } => {
                debug!(target = "replication", peer = %peer, count, "peer finished pushing");
                Ok(Inbound::EndPeerReplicate)
            }
        }
    }
}
