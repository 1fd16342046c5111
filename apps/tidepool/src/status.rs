//! Status events published to the UI boundary.

use std::fmt;

use tokio::sync::broadcast;
use tracing::debug;

use crate::identity::PeerId;

const STATUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Connecting(PeerId),
    Connected(PeerId),
    Disconnected(PeerId),
    Replicating(PeerId),
    /// The peer confirmed it received our replication round.
    AcknowledgedSent(PeerId),
    /// We received a full replication round from the peer.
    AcknowledgedReceive(PeerId),
    RelayConnected,
    RelayDisconnected,
}

impl StatusEvent {
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            StatusEvent::Connecting(peer)
            | StatusEvent::Connected(peer)
            | StatusEvent::Disconnected(peer)
            | StatusEvent::Replicating(peer)
            | StatusEvent::AcknowledgedSent(peer)
            | StatusEvent::AcknowledgedReceive(peer) => Some(peer),
            StatusEvent::RelayConnected | StatusEvent::RelayDisconnected => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::Connecting(_) => "connecting",
            StatusEvent::Connected(_) => "connected",
            StatusEvent::Disconnected(_) => "disconnected",
            StatusEvent::Replicating(_) => "replicating",
            StatusEvent::AcknowledgedSent(_) => "acknowledged_sent",
            StatusEvent::AcknowledgedReceive(_) => "acknowledged_receive",
            StatusEvent::RelayConnected => "relay_connected",
            StatusEvent::RelayDisconnected => "relay_disconnected",
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer() {
            Some(peer) => write!(f, "{} {}", self.name(), peer),
            None => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusReporter {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Publishes `event`; having no subscribers is fine.
    pub fn report(&self, event: StatusEvent) {
        debug!(event = %event, "status");
        let _ = self.tx.send(event);
    }
}
