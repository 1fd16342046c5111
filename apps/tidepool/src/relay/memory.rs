//! In-process relay hub. Every frame sent by a member is delivered to every
//! member dialed on the same address, the sender included, like a relay that
//! echoes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{RelayConnection, RelayDialer, RelayError};

#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<Hub>>,
}

#[derive(Default)]
struct Hub {
    next_member: u64,
    members: HashMap<String, Vec<Member>>,
    dials: usize,
    offline: bool,
    taps: Vec<mpsc::UnboundedSender<String>>,
}

struct Member {
    id: u64,
    inbound: mpsc::UnboundedSender<String>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dial attempts, failed ones included.
    pub fn dial_count(&self) -> usize {
        self.inner.lock().dials
    }

    pub fn members(&self, address: &str) -> usize {
        self.inner
            .lock()
            .members
            .get(address)
            .map_or(0, Vec::len)
    }

    /// While offline every dial fails.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Drops every member connection; their `inbound` streams end.
    pub fn disconnect_all(&self) {
        self.inner.lock().members.clear();
    }

    /// Delivers `text` to every member of `address` as if a remote peer sent it.
    pub fn inject(&self, address: &str, text: impl Into<String>) {
        let text = text.into();
        let hub = self.inner.lock();
        if let Some(members) = hub.members.get(address) {
            for member in members {
                let _ = member.inbound.send(text.clone());
            }
        }
    }

    /// Receives a copy of every frame members send, in send order.
    pub fn tap(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().taps.push(tx);
        rx
    }
}

#[async_trait]
impl RelayDialer for MemoryRelay {
    async fn dial(&self, address: &str) -> Result<RelayConnection, RelayError> {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();
        let member = {
            let mut hub = self.inner.lock();
            hub.dials += 1;
            if hub.offline {
                return Err(RelayError::Connect("relay offline".into()));
            }
            hub.next_member += 1;
            let id = hub.next_member;
            hub.members
                .entry(address.to_string())
                .or_default()
                .push(Member {
                    id,
                    inbound: inbound_tx,
                });
            id
        };

        let hub = self.inner.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                let mut hub = hub.lock();
                let present = hub
                    .members
                    .get(&address)
                    .is_some_and(|members| members.iter().any(|m| m.id == member));
                // A disconnected member's writes go nowhere.
                if !present {
                    continue;
                }
                hub.taps.retain(|tap| tap.send(text.clone()).is_ok());
                if let Some(members) = hub.members.get(&address) {
                    for target in members {
                        let _ = target.inbound.send(text.clone());
                    }
                }
            }
            let mut hub = hub.lock();
            if let Some(members) = hub.members.get_mut(&address) {
                members.retain(|m| m.id != member);
            }
        });

        Ok(RelayConnection { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn frames_reach_every_member_including_sender() {
        let relay = MemoryRelay::new();
        let mut tap = relay.tap();
        let mut a = relay.dial("mem://s").await.unwrap();
        let mut b = relay.dial("mem://s").await.unwrap();
        let mut other = relay.dial("mem://elsewhere").await.unwrap();

        a.outbound.send("hello".into()).unwrap();
        assert_eq!(a.inbound.recv().await.unwrap(), "hello");
        assert_eq!(b.inbound.recv().await.unwrap(), "hello");
        assert_eq!(tap.recv().await.unwrap(), "hello");
        assert!(other.inbound.try_recv().is_err());
        assert_eq!(relay.dial_count(), 3);
    }

    #[test_timeout::tokio_timeout_test]
    async fn disconnect_ends_inbound_and_offline_refuses() {
        let relay = MemoryRelay::new();
        let mut a = relay.dial("mem://s").await.unwrap();
        relay.disconnect_all();
        assert!(a.inbound.recv().await.is_none());
        assert_eq!(relay.members("mem://s"), 0);

        relay.set_offline(true);
        assert!(matches!(
            relay.dial("mem://s").await,
            Err(RelayError::Connect(_))
        ));
        assert_eq!(relay.dial_count(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn injected_frames_arrive() {
        let relay = MemoryRelay::new();
        let mut a = relay.dial("mem://s").await.unwrap();
        relay.inject("mem://s", "{}");
        assert_eq!(a.inbound.recv().await.unwrap(), "{}");
    }
}
