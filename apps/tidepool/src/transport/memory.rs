//! In-process connector used by tests and local simulation.
//!
//! Descriptions carry a `memory:<token>` address instead of SDP. Two
//! connections pair up once each side has applied the other's description and
//! at least one remote candidate, then both receive [`LinkEvent::Open`].
//! Candidates offered before a remote description are rejected, the same way
//! a real ICE agent rejects them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::trace;
use uuid::Uuid;

use super::{
    Connector, DataChannel, LinkEvent, LinkEventSender, LinkId, LinkSignal, PeerConnection,
    TransportError,
};
use crate::config::DEFAULT_CHANNEL_LABEL;
use crate::protocol::Frame;

const ADDRESS_PREFIX: &str = "memory:";

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Fabric>>,
}

#[derive(Default)]
struct Fabric {
    endpoints: HashMap<String, Endpoint>,
    channels: Vec<Arc<MemoryDataChannel>>,
}

struct Endpoint {
    link: LinkId,
    events: LinkEventSender,
    remote: Option<String>,
    candidate_applied: bool,
    paired: bool,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels that are paired and not yet closed, counted per side.
    pub fn open_channels(&self) -> usize {
        self.inner
            .lock()
            .channels
            .iter()
            .filter(|channel| !channel.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Closes every open channel, as if the network dropped all links.
    pub async fn sever_all(&self) {
        let channels: Vec<_> = self.inner.lock().channels.drain(..).collect();
        for channel in channels {
            channel.close().await;
        }
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(
        &self,
        link: LinkId,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        Ok(Box::new(MemoryConnection {
            network: self.clone(),
            link,
            events,
            token: Mutex::new(None),
        }))
    }
}

struct MemoryConnection {
    network: MemoryNetwork,
    link: LinkId,
    events: LinkEventSender,
    token: Mutex<Option<String>>,
}

impl MemoryConnection {
    fn register(&self) -> String {
        let mut slot = self.token.lock();
        if let Some(token) = slot.as_ref() {
            return token.clone();
        }
        let token = Uuid::new_v4().simple().to_string();
        self.network.inner.lock().endpoints.insert(
            token.clone(),
            Endpoint {
                link: self.link,
                events: self.events.clone(),
                remote: None,
                candidate_applied: false,
                paired: false,
            },
        );
        *slot = Some(token.clone());
        token
    }

    fn describe(&self, kind: &str) -> Value {
        let token = self.register();
        let _ = self.events.send(LinkSignal {
            link: self.link,
            event: LinkEvent::LocalCandidate(json!({
                "candidate": format!("candidate:{ADDRESS_PREFIX}{token}"),
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            })),
        });
        json!({ "type": kind, "sdp": format!("{ADDRESS_PREFIX}{token}") })
    }

    fn remote_of(description: &Value) -> Result<String, TransportError> {
        description
            .get("sdp")
            .and_then(Value::as_str)
            .and_then(|sdp| sdp.strip_prefix(ADDRESS_PREFIX))
            .map(str::to_string)
            .ok_or_else(|| TransportError::Negotiation("not a memory description".into()))
    }

    fn try_pair(&self) {
        let Some(local) = self.token.lock().clone() else {
            return;
        };
        let mut fabric = self.network.inner.lock();
        let Some(remote) = fabric
            .endpoints
            .get(&local)
            .filter(|endpoint| endpoint.candidate_applied && !endpoint.paired)
            .and_then(|endpoint| endpoint.remote.clone())
        else {
            return;
        };
        let ready = fabric.endpoints.get(&remote).is_some_and(|endpoint| {
            endpoint.remote.as_deref() == Some(local.as_str())
                && endpoint.candidate_applied
                && !endpoint.paired
        });
        if !ready {
            return;
        }

        let closed = Arc::new(AtomicBool::new(false));
        let (ours, theirs) = {
            let (Some(a), Some(b)) = (fabric.endpoints.get(&local), fabric.endpoints.get(&remote))
            else {
                return;
            };
            let ours = Arc::new(MemoryDataChannel {
                label: DEFAULT_CHANNEL_LABEL.to_string(),
                local: (a.link, a.events.clone()),
                remote: (b.link, b.events.clone()),
                closed: closed.clone(),
            });
            let theirs = Arc::new(MemoryDataChannel {
                label: DEFAULT_CHANNEL_LABEL.to_string(),
                local: (b.link, b.events.clone()),
                remote: (a.link, a.events.clone()),
                closed,
            });
            (ours, theirs)
        };
        for token in [&local, &remote] {
            if let Some(endpoint) = fabric.endpoints.get_mut(token) {
                endpoint.paired = true;
            }
        }
        fabric.channels.push(ours.clone());
        fabric.channels.push(theirs.clone());
        drop(fabric);

        trace!(target = "link", local = %ours.local.0, remote = %ours.remote.0, "memory channel paired");
        for channel in [ours, theirs] {
            let _ = channel.local.1.send(LinkSignal {
                link: channel.local.0,
                event: LinkEvent::Open(channel.clone()),
            });
        }
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn create_offer(&self) -> Result<Value, TransportError> {
        Ok(self.describe("offer"))
    }

    async fn create_answer(&self) -> Result<Value, TransportError> {
        let token = self.register();
        let described = self
            .network
            .inner
            .lock()
            .endpoints
            .get(&token)
            .is_some_and(|endpoint| endpoint.remote.is_some());
        if !described {
            return Err(TransportError::Negotiation(
                "answer requested before remote offer".into(),
            ));
        }
        let answer = self.describe("answer");
        self.try_pair();
        Ok(answer)
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), TransportError> {
        let remote = Self::remote_of(&description)?;
        let token = self.register();
        if let Some(endpoint) = self.network.inner.lock().endpoints.get_mut(&token) {
            endpoint.remote = Some(remote);
        }
        self.try_pair();
        Ok(())
    }

    async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        let token = self.register();
        {
            let mut fabric = self.network.inner.lock();
            let Some(endpoint) = fabric.endpoints.get_mut(&token) else {
                return Err(TransportError::ChannelClosed);
            };
            if endpoint.remote.is_none() {
                return Err(TransportError::Negotiation(
                    "candidate before remote description".into(),
                ));
            }
            if candidate.get("candidate").and_then(Value::as_str).is_none() {
                return Err(TransportError::Negotiation("malformed candidate".into()));
            }
            endpoint.candidate_applied = true;
        }
        self.try_pair();
        Ok(())
    }

    async fn close(&self) {
        let Some(token) = self.token.lock().take() else {
            return;
        };
        let link = self.link;
        let channels: Vec<_> = {
            let mut fabric = self.network.inner.lock();
            fabric.endpoints.remove(&token);
            let (mine, rest): (Vec<_>, Vec<_>) = fabric
                .channels
                .drain(..)
                .partition(|channel| channel.local.0 == link && channel.local.1.same_channel(&self.events));
            fabric.channels = rest;
            mine
        };
        for channel in channels {
            channel.close().await;
        }
    }
}

pub struct MemoryDataChannel {
    label: String,
    local: (LinkId, LinkEventSender),
    remote: (LinkId, LinkEventSender),
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.remote
            .1
            .send(LinkSignal {
                link: self.remote.0,
                event: LinkEvent::Message(frame),
            })
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (link, events) in [&self.local, &self.remote] {
            let _ = events.send(LinkSignal {
                link: *link,
                event: LinkEvent::Closed,
            });
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn next_open(
        rx: &mut mpsc::UnboundedReceiver<LinkSignal>,
    ) -> (LinkId, Arc<dyn DataChannel>) {
        loop {
            let signal = rx.recv().await.unwrap();
            if let LinkEvent::Open(channel) = signal.event {
                return (signal.link, channel);
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn pairs_after_full_exchange() {
        let network = MemoryNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.connect(LinkId(1), a_tx).await.unwrap();
        let b = network.connect(LinkId(2), b_tx).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        let a_candidate = match a_rx.recv().await.unwrap().event {
            LinkEvent::LocalCandidate(candidate) => candidate,
            other => panic!("unexpected {other:?}"),
        };
        assert!(b.add_candidate(a_candidate.clone()).await.is_err());

        b.set_remote_description(offer).await.unwrap();
        b.add_candidate(a_candidate).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        let b_candidate = match b_rx.recv().await.unwrap().event {
            LinkEvent::LocalCandidate(candidate) => candidate,
            other => panic!("unexpected {other:?}"),
        };
        a.set_remote_description(answer).await.unwrap();
        assert_eq!(network.open_channels(), 0);
        a.add_candidate(b_candidate).await.unwrap();

        let (a_link, a_channel) = next_open(&mut a_rx).await;
        let (b_link, _b_channel) = next_open(&mut b_rx).await;
        assert_eq!((a_link, b_link), (LinkId(1), LinkId(2)));
        assert_eq!(network.open_channels(), 2);

        a_channel.send(Frame::text("<replicating>")).await.unwrap();
        let signal = b_rx.recv().await.unwrap();
        assert_eq!(signal.link, LinkId(2));
        assert!(matches!(signal.event, LinkEvent::Message(Frame::Text(ref t)) if t == "<replicating>"));

        network.sever_all().await;
        assert!(matches!(b_rx.recv().await.unwrap().event, LinkEvent::Closed));
        assert!(a_channel.send(Frame::text("late")).await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_requires_remote_offer() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let b = network.connect(LinkId(1), tx).await.unwrap();
        assert!(b.create_answer().await.is_err());
        assert!(b
            .set_remote_description(json!({"type": "offer", "sdp": "v=0"}))
            .await
            .is_err());
    }
}
