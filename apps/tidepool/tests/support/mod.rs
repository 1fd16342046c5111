#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use tidepool::protocol::{Signal, SignalingMessage};
use tidepool::relay::MemoryRelay;
use tidepool::store::MemoryStore;
use tidepool::store::StreamReplicator;
use tidepool::transport::memory::MemoryNetwork;
use tidepool::{Node, NodeConfig, NodeHandle, NodeParts, NodeSnapshot, PeerId, StatusEvent};

pub const ADDRESS: &str = "mem://subnet/tidepool-test";

pub struct Peer {
    pub id: PeerId,
    pub handle: NodeHandle,
    pub store: Arc<MemoryStore>,
    /// Every status event consumed so far, in order.
    pub seen: Vec<StatusEvent>,
    events: broadcast::Receiver<StatusEvent>,
    task: JoinHandle<()>,
}

impl Peer {
    pub fn spawn(name: &str, relay: &MemoryRelay, network: &MemoryNetwork) -> Self {
        Self::spawn_with(name, relay, network, NodeConfig::new(ADDRESS))
    }

    pub fn spawn_with(
        name: &str,
        relay: &MemoryRelay,
        network: &MemoryNetwork,
        config: NodeConfig,
    ) -> Self {
        let id = PeerId::new(name);
        let store = Arc::new(MemoryStore::new());
        let parts = NodeParts {
            dialer: Arc::new(relay.clone()),
            connector: Arc::new(network.clone()),
            store: store.clone(),
            replicator: Arc::new(StreamReplicator::new(store.clone())),
        };
        let (node, handle) = Node::new(config, id.clone(), parts);
        let events = handle.subscribe();
        let task = node.spawn();
        Self {
            id,
            handle,
            store,
            seen: Vec::new(),
            events,
            task,
        }
    }

    /// Returns once `expected` has been reported at least once.
    pub async fn wait_for(&mut self, expected: StatusEvent) {
        self.wait_count(expected, 1).await;
    }

    /// Returns once `expected` has been reported `times` times in total.
    pub async fn wait_count(&mut self, expected: StatusEvent, times: usize) {
        while self.count(&expected) < times {
            let event = self.events.recv().await.expect("status stream ended");
            self.seen.push(event);
        }
    }

    /// Index of the first consumed occurrence of `event`.
    pub fn position(&self, event: &StatusEvent) -> Option<usize> {
        self.seen.iter().position(|seen| seen == event)
    }

    pub fn count(&self, event: &StatusEvent) -> usize {
        self.seen.iter().filter(|seen| *seen == event).count()
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        self.handle.snapshot().await.expect("node stopped")
    }

    pub async fn wait_until(&self, condition: impl Fn(&NodeSnapshot) -> bool) -> NodeSnapshot {
        loop {
            let snapshot = self.snapshot().await;
            if condition(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn stop(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}

/// Reads relay traffic until `peer`'s notify has gone through the hub.
pub async fn notified(tap: &mut mpsc::UnboundedReceiver<String>, peer: &PeerId) {
    loop {
        let text = tap.recv().await.expect("relay tap closed");
        if let Ok(message) = SignalingMessage::decode(&text) {
            if message.from == *peer && message.signal == Signal::Notify {
                return;
            }
        }
    }
}

/// Encodes a message as `from` would put it on the relay.
pub fn frame_from(from: &str, mut message: SignalingMessage) -> String {
    message.from = PeerId::new(from);
    message.encode().expect("encodable message")
}
