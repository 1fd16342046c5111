use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{DataChannel, LinkId, PeerConnection, TransportError};
use crate::identity::PeerId;
use crate::protocol::LinkName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// We sent the offer.
    Initiator,
    /// We answer an offer that arrived over the relay.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Initiator producing its offer.
    CollectingLocal,
    /// Waiting for the remote side's description.
    AwaitingRemote,
    /// Descriptions exchanged; waiting for the data channel to open.
    Connecting,
    Ready,
    Closed,
}

impl NegotiationState {
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::CollectingLocal
                | NegotiationState::AwaitingRemote
                | NegotiationState::Connecting
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Buffered,
}

/// A negotiated (or negotiating) direct link to one peer.
///
/// Remote candidates that arrive before the remote description are held back
/// and replayed, in arrival order, right after the description is applied.
pub struct TransportLink {
    id: LinkId,
    name: LinkName,
    peer: Option<PeerId>,
    role: LinkRole,
    state: NegotiationState,
    remote_described: bool,
    pending_candidates: Vec<Value>,
    connection: Box<dyn PeerConnection>,
    channel: Option<Arc<dyn DataChannel>>,
    created_at: Instant,
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}

impl TransportLink {
    pub fn new(
        id: LinkId,
        name: LinkName,
        peer: Option<PeerId>,
        role: LinkRole,
        connection: Box<dyn PeerConnection>,
    ) -> Self {
        let state = match role {
            LinkRole::Initiator => NegotiationState::CollectingLocal,
            LinkRole::Responder => NegotiationState::AwaitingRemote,
        };
        Self {
            id,
            name,
            peer,
            role,
            state,
            remote_described: false,
            pending_candidates: Vec::new(),
            connection,
            channel: None,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &LinkName {
        &self.name
    }

    pub fn peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == NegotiationState::Ready
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_described
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.clone()
    }

    pub(crate) fn bind_peer(&mut self, peer: PeerId) {
        self.peer = Some(peer);
    }

    /// Produces the local offer. Initiator only.
    pub async fn start_offer(&mut self) -> Result<Value, TransportError> {
        if self.role != LinkRole::Initiator || self.state != NegotiationState::CollectingLocal {
            return Err(TransportError::InvalidState("creating an offer"));
        }
        let offer = self.connection.create_offer().await?;
        self.state = NegotiationState::AwaitingRemote;
        Ok(offer)
    }

    /// Applies the remote offer and produces our answer. Responder only.
    pub async fn accept_offer(&mut self, offer: Value) -> Result<Value, TransportError> {
        if self.role != LinkRole::Responder || self.state != NegotiationState::AwaitingRemote {
            return Err(TransportError::InvalidState("answering an offer"));
        }
        self.apply_remote_description(offer).await?;
        let answer = self.connection.create_answer().await?;
        self.state = NegotiationState::Connecting;
        Ok(answer)
    }

    /// Applies the remote answer. Initiator only.
    pub async fn accept_answer(&mut self, answer: Value) -> Result<(), TransportError> {
        if self.role != LinkRole::Initiator || self.state != NegotiationState::AwaitingRemote {
            return Err(TransportError::InvalidState("applying an answer"));
        }
        self.apply_remote_description(answer).await?;
        self.state = NegotiationState::Connecting;
        Ok(())
    }

    pub async fn apply_candidate(
        &mut self,
        candidate: Value,
    ) -> Result<CandidateOutcome, TransportError> {
        if self.state == NegotiationState::Closed {
            return Err(TransportError::InvalidState("adding a candidate"));
        }
        if !self.remote_described {
            self.pending_candidates.push(candidate);
            debug!(
                target = "link",
                link = %self.id,
                conn = %self.name,
                buffered = self.pending_candidates.len(),
                "buffered remote candidate until description arrives"
            );
            return Ok(CandidateOutcome::Buffered);
        }
        self.connection.add_candidate(candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    async fn apply_remote_description(&mut self, description: Value) -> Result<(), TransportError> {
        if self.remote_described {
            return Err(TransportError::InvalidState("a second remote description"));
        }
        self.connection.set_remote_description(description).await?;
        self.remote_described = true;
        let buffered = std::mem::take(&mut self.pending_candidates);
        let count = buffered.len();
        for candidate in buffered {
            // One bad candidate does not sink the others.
            if let Err(err) = self.connection.add_candidate(candidate).await {
                warn!(
                    target = "link",
                    link = %self.id,
                    conn = %self.name,
                    error = %err,
                    "buffered candidate rejected"
                );
            }
        }
        if count > 0 {
            debug!(
                target = "link",
                link = %self.id,
                conn = %self.name,
                count,
                "flushed buffered candidates"
            );
        }
        Ok(())
    }

    pub fn mark_ready(&mut self, channel: Arc<dyn DataChannel>) -> Result<(), TransportError> {
        if !self.state.is_negotiating() {
            return Err(TransportError::InvalidState("opening a data channel"));
        }
        self.channel = Some(channel);
        self.state = NegotiationState::Ready;
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.connection.close().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Offer,
        Answer,
        Remote(Value),
        Candidate(Value),
        Close,
    }

    /// Records calls and rejects candidates before a remote description, like a real stack.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingConnection {
        pub calls: Arc<Mutex<Vec<Call>>>,
        described: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl PeerConnection for RecordingConnection {
        async fn create_offer(&self) -> Result<Value, TransportError> {
            self.calls.lock().push(Call::Offer);
            Ok(json!({"type": "offer", "sdp": "local"}))
        }

        async fn create_answer(&self) -> Result<Value, TransportError> {
            self.calls.lock().push(Call::Answer);
            Ok(json!({"type": "answer", "sdp": "local"}))
        }

        async fn set_remote_description(&self, description: Value) -> Result<(), TransportError> {
            self.calls.lock().push(Call::Remote(description));
            *self.described.lock() = true;
            Ok(())
        }

        async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError> {
            if !*self.described.lock() {
                return Err(TransportError::Negotiation("no remote description".into()));
            }
            self.calls.lock().push(Call::Candidate(candidate));
            Ok(())
        }

        async fn close(&self) {
            self.calls.lock().push(Call::Close);
        }
    }

    fn responder(connection: RecordingConnection) -> TransportLink {
        TransportLink::new(
            LinkId(1),
            LinkName::from("conn-x"),
            Some(PeerId::from("b")),
            LinkRole::Responder,
            Box::new(connection),
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_before_offer_are_replayed_in_order() {
        let connection = RecordingConnection::default();
        let mut link = responder(connection.clone());

        let first = link.apply_candidate(json!({"candidate": "c1"})).await.unwrap();
        let second = link.apply_candidate(json!({"candidate": "c2"})).await.unwrap();
        assert_eq!(first, CandidateOutcome::Buffered);
        assert_eq!(second, CandidateOutcome::Buffered);
        assert_eq!(link.pending_candidates(), 2);

        link.accept_offer(json!({"type": "offer"})).await.unwrap();
        assert_eq!(link.state(), NegotiationState::Connecting);
        assert_eq!(link.pending_candidates(), 0);
        assert_eq!(
            *connection.calls.lock(),
            vec![
                Call::Remote(json!({"type": "offer"})),
                Call::Candidate(json!({"candidate": "c1"})),
                Call::Candidate(json!({"candidate": "c2"})),
                Call::Answer,
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_after_offer_apply_immediately() {
        let connection = RecordingConnection::default();
        let mut link = responder(connection.clone());
        link.accept_offer(json!({"type": "offer"})).await.unwrap();
        let outcome = link.apply_candidate(json!({"candidate": "c1"})).await.unwrap();
        assert_eq!(outcome, CandidateOutcome::Applied);
        assert!(connection
            .calls
            .lock()
            .contains(&Call::Candidate(json!({"candidate": "c1"}))));
    }

    #[test_timeout::tokio_timeout_test]
    async fn initiator_walks_through_states() {
        let connection = RecordingConnection::default();
        let mut link = TransportLink::new(
            LinkId(2),
            LinkName::from("conn-y"),
            None,
            LinkRole::Initiator,
            Box::new(connection.clone()),
        );
        assert_eq!(link.state(), NegotiationState::CollectingLocal);
        link.start_offer().await.unwrap();
        assert_eq!(link.state(), NegotiationState::AwaitingRemote);
        link.apply_candidate(json!({"candidate": "early"})).await.unwrap();
        link.accept_answer(json!({"type": "answer"})).await.unwrap();
        assert_eq!(link.state(), NegotiationState::Connecting);
        assert!(link.has_remote_description());

        let err = link.accept_answer(json!({"type": "answer"})).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn responder_cannot_offer() {
        let mut link = responder(RecordingConnection::default());
        assert!(link.start_offer().await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent() {
        let connection = RecordingConnection::default();
        let mut link = responder(connection.clone());
        link.close().await;
        link.close().await;
        assert_eq!(link.state(), NegotiationState::Closed);
        let closes = connection
            .calls
            .lock()
            .iter()
            .filter(|call| **call == Call::Close)
            .count();
        assert_eq!(closes, 1);
        assert!(link.apply_candidate(json!({})).await.is_err());
    }
}
