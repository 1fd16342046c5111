use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::identity::PeerId;
use crate::transport::{DataChannel, LinkId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Our push for `round` is in flight over `link`.
    Replicating { round: u64, link: LinkId },
    /// Push finished; waiting for the peer's `<received>` on `link`.
    AwaitingAck {
        round: u64,
        link: LinkId,
        since: Instant,
    },
}

impl SessionState {
    pub fn round(self) -> Option<u64> {
        match self {
            SessionState::Idle => None,
            SessionState::Replicating { round, .. } | SessionState::AwaitingAck { round, .. } => {
                Some(round)
            }
        }
    }

    /// The link the outstanding round was pushed over. Only a `<received>`
    /// arriving on this link closes the round.
    pub fn link(self) -> Option<LinkId> {
        match self {
            SessionState::Idle => None,
            SessionState::Replicating { link, .. } | SessionState::AwaitingAck { link, .. } => {
                Some(link)
            }
        }
    }
}

/// Replication state shared by every ready link to one peer.
pub struct ReplicationSession {
    peer: PeerId,
    pub(crate) links: BTreeMap<LinkId, Arc<dyn DataChannel>>,
    pub(crate) state: SessionState,
    pub(crate) push: Option<JoinHandle<()>>,
    pub(crate) awaiting_sent: bool,
    pub(crate) rounds_acknowledged: u64,
}

impl ReplicationSession {
    pub(crate) fn new(peer: PeerId) -> Self {
        Self {
            peer,
            links: BTreeMap::new(),
            state: SessionState::Idle,
            push: None,
            awaiting_sent: false,
            rounds_acknowledged: 0,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn links(&self) -> impl Iterator<Item = LinkId> + '_ {
        self.links.keys().copied()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn rounds_acknowledged(&self) -> u64 {
        self.rounds_acknowledged
    }

    /// We acknowledged the peer's round with `<received>` and its `<sent>`
    /// has not arrived yet.
    pub fn awaiting_confirmation(&self) -> bool {
        self.awaiting_sent
    }

    /// The link replication pushes go over.
    pub(crate) fn primary(&self) -> Option<(LinkId, Arc<dyn DataChannel>)> {
        self.links
            .iter()
            .next()
            .map(|(id, channel)| (*id, channel.clone()))
    }

    /// True when a new round may start. An acknowledgment outstanding longer
    /// than `ack_timeout` no longer blocks.
    pub(crate) fn can_start(&self, now: Instant, ack_timeout: Duration) -> bool {
        match self.state {
            SessionState::Idle => true,
            SessionState::Replicating { .. } => false,
            SessionState::AwaitingAck { since, .. } => {
                now.saturating_duration_since(since) >= ack_timeout
            }
        }
    }

    pub(crate) fn cancel_round(&mut self) {
        if let Some(push) = self.push.take() {
            push.abort();
        }
        self.state = SessionState::Idle;
    }
}

impl Drop for ReplicationSession {
    fn drop(&mut self) {
        if let Some(push) = self.push.take() {
            push.abort();
        }
    }
}
