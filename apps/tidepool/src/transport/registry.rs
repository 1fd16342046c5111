use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{Connector, LinkEventSender, LinkId, LinkRole, TransportError, TransportLink};
use crate::identity::PeerId;
use crate::protocol::LinkName;

/// Registry key of a link. Offers broadcast to nobody in particular are kept
/// under their name alone until the first answer names the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkKey {
    Bound { peer: PeerId, name: LinkName },
    Unbound(LinkName),
}

impl LinkKey {
    pub fn bound(peer: PeerId, name: LinkName) -> Self {
        LinkKey::Bound { peer, name }
    }

    pub fn name(&self) -> &LinkName {
        match self {
            LinkKey::Bound { name, .. } | LinkKey::Unbound(name) => name,
        }
    }

    fn of(link: &TransportLink) -> Self {
        match link.peer() {
            Some(peer) => LinkKey::bound(peer.clone(), link.name().clone()),
            None => LinkKey::Unbound(link.name().clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Existing(LinkId),
    /// A name-only placeholder now bound to the sender.
    Rebound(LinkId),
    Created(LinkId),
}

impl Resolution {
    pub fn id(self) -> LinkId {
        match self {
            Resolution::Existing(id) | Resolution::Rebound(id) | Resolution::Created(id) => id,
        }
    }
}

/// Owns every transport link of the node, in-progress and established.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    next_id: u64,
    keys: HashMap<LinkKey, LinkId>,
    links: HashMap<LinkId, TransportLink>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn get(&self, id: LinkId) -> Option<&TransportLink> {
        self.links.get(&id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut TransportLink> {
        self.links.get_mut(&id)
    }

    pub fn lookup(&self, key: &LinkKey) -> Option<LinkId> {
        self.keys.get(key).copied()
    }

    pub fn links(&self) -> impl Iterator<Item = &TransportLink> {
        self.links.values()
    }

    /// Finds the link for `(peer, name)`, adopting a matching placeholder.
    /// Never creates anything.
    pub fn bind(&mut self, peer: &PeerId, name: &LinkName) -> Option<Resolution> {
        let key = LinkKey::bound(peer.clone(), name.clone());
        if let Some(id) = self.keys.get(&key) {
            return Some(Resolution::Existing(*id));
        }
        let id = self.keys.remove(&LinkKey::Unbound(name.clone()))?;
        let link = self.links.get_mut(&id)?;
        link.bind_peer(peer.clone());
        self.keys.insert(key, id);
        debug!(
            target = "link",
            link = %id,
            peer = %peer,
            conn = %name,
            "placeholder bound to peer"
        );
        Some(Resolution::Rebound(id))
    }

    /// Like [`bind`](Self::bind), but creates a responder link when nothing matches.
    pub async fn resolve(
        &mut self,
        peer: &PeerId,
        name: &LinkName,
        connector: &dyn Connector,
        events: &LinkEventSender,
    ) -> Result<Resolution, TransportError> {
        if let Some(resolution) = self.bind(peer, name) {
            return Ok(resolution);
        }
        let id = self.allocate();
        let connection = connector.connect(id, events.clone()).await?;
        let link = TransportLink::new(
            id,
            name.clone(),
            Some(peer.clone()),
            LinkRole::Responder,
            connection,
        );
        self.insert(link);
        debug!(target = "link", link = %id, peer = %peer, conn = %name, "responder link created");
        Ok(Resolution::Created(id))
    }

    /// Creates an initiator link under a fresh name.
    pub async fn create_outbound(
        &mut self,
        peer: Option<PeerId>,
        connector: &dyn Connector,
        events: &LinkEventSender,
    ) -> Result<LinkId, TransportError> {
        let name = loop {
            let candidate = LinkName::generate();
            let taken = self.links.values().any(|link| link.name() == &candidate);
            if !taken {
                break candidate;
            }
        };
        let id = self.allocate();
        let connection = connector.connect(id, events.clone()).await?;
        let link = TransportLink::new(id, name, peer, LinkRole::Initiator, connection);
        self.insert(link);
        Ok(id)
    }

    pub async fn close(&mut self, id: LinkId) -> Option<TransportLink> {
        let mut link = self.links.remove(&id)?;
        let key = LinkKey::of(&link);
        if self.keys.get(&key) == Some(&id) {
            self.keys.remove(&key);
        }
        link.close().await;
        Some(link)
    }

    pub async fn close_key(&mut self, key: &LinkKey) -> Option<TransportLink> {
        let id = self.lookup(key)?;
        self.close(id).await
    }

    /// Closes every link that has not reached ready.
    pub async fn discard_pending(&mut self) -> Vec<TransportLink> {
        let pending: Vec<LinkId> = self
            .links
            .values()
            .filter(|link| !link.is_ready())
            .map(TransportLink::id)
            .collect();
        let mut discarded = Vec::with_capacity(pending.len());
        for id in pending {
            if let Some(link) = self.close(id).await {
                discarded.push(link);
            }
        }
        discarded
    }

    /// Links still negotiating `timeout` after they were created.
    pub fn expired(&self, timeout: Duration, now: Instant) -> Vec<LinkId> {
        let mut ids: Vec<LinkId> = self
            .links
            .values()
            .filter(|link| link.state().is_negotiating())
            .filter(|link| now.saturating_duration_since(link.created_at()) >= timeout)
            .map(TransportLink::id)
            .collect();
        ids.sort();
        ids
    }

    fn allocate(&mut self) -> LinkId {
        self.next_id += 1;
        LinkId(self.next_id)
    }

    fn insert(&mut self, link: TransportLink) {
        self.keys.insert(LinkKey::of(&link), link.id());
        self.links.insert(link.id(), link);
    }
}
