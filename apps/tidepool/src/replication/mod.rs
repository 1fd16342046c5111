//! Per-peer replication sessions and the acknowledgment handshake.
//!
//! A round runs `<replicating>` → batched push → peer replies `<received>` →
//! we reply `<sent>` and compact. Only one round per peer is outstanding at
//! a time; triggers that land while a round is outstanding are dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::identity::PeerId;
use crate::protocol::{Frame, Sentinel};
use crate::status::{StatusEvent, StatusReporter};
use crate::store::{DocumentStore, Inbound, PushReport, Replicator, StoreError};
use crate::transport::{DataChannel, LinkId};

mod session;

pub use session::{ReplicationSession, SessionState};

/// Result of a push task, reported back to the event loop.
#[derive(Debug)]
pub struct PushOutcome {
    pub peer: PeerId,
    pub round: u64,
    pub result: Result<PushReport, StoreError>,
}

pub struct ReplicationCoordinator {
    sessions: BTreeMap<PeerId, ReplicationSession>,
    replicator: Arc<dyn Replicator>,
    store: Arc<dyn DocumentStore>,
    status: StatusReporter,
    outcomes: mpsc::UnboundedSender<PushOutcome>,
    compacting: Arc<AtomicBool>,
    batch_size: usize,
    ack_timeout: Duration,
    next_round: u64,
}

impl ReplicationCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        replicator: Arc<dyn Replicator>,
        status: StatusReporter,
        outcomes: mpsc::UnboundedSender<PushOutcome>,
        batch_size: usize,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            sessions: BTreeMap::new(),
            replicator,
            store,
            status,
            outcomes,
            compacting: Arc::new(AtomicBool::new(false)),
            batch_size,
            ack_timeout,
            next_round: 0,
        }
    }

    pub fn session(&self, peer: &PeerId) -> Option<&ReplicationSession> {
        self.sessions.get(peer)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ReplicationSession> {
        self.sessions.values()
    }

    pub async fn on_link_ready(&mut self, peer: PeerId, link: LinkId, channel: Arc<dyn DataChannel>) {
        let session = self
            .sessions
            .entry(peer.clone())
            .or_insert_with(|| ReplicationSession::new(peer.clone()));
        session.links.insert(link, channel);
        info!(target = "replication", peer = %peer, link = %link, links = session.link_count(), "link ready");
        self.status.report(StatusEvent::Connected(peer));
        self.replicate_all().await;
    }

    pub fn on_link_closed(&mut self, peer: &PeerId, link: LinkId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.links.remove(&link).is_none() {
            return;
        }
        self.status.report(StatusEvent::Disconnected(peer.clone()));
        if session.links.is_empty() {
            info!(target = "replication", peer = %peer, "last link closed; session ended");
            // Dropping the session aborts any push still running.
            self.sessions.remove(peer);
            return;
        }
        if session.state.link() == Some(link) {
            warn!(target = "replication", peer = %peer, link = %link, "link closed mid-push; round cancelled");
            session.cancel_round();
        }
    }

    /// Starts a round with every peer whose session is free to take one.
    pub async fn replicate_all(&mut self) {
        let now = Instant::now();
        for session in self.sessions.values_mut() {
            if !session.can_start(now, self.ack_timeout) {
                debug!(
                    target = "replication",
                    peer = %session.peer(),
                    state = ?session.state(),
                    "round outstanding; trigger ignored"
                );
                continue;
            }
            if let SessionState::AwaitingAck { round, .. } = session.state {
                warn!(
                    target = "replication",
                    peer = %session.peer(),
                    round,
                    "acknowledgment overdue; starting a new round"
                );
            }
            let Some((link, channel)) = session.primary() else {
                continue;
            };
            self.next_round += 1;
            let round = self.next_round;
            let peer = session.peer().clone();
            session.state = SessionState::Replicating { round, link };
            self.status.report(StatusEvent::Replicating(peer.clone()));
            for (id, link_channel) in &session.links {
                if let Err(err) = link_channel.send(Sentinel::Replicating.frame()).await {
                    warn!(target = "replication", peer = %peer, link = %id, error = %err, "failed to announce round");
                }
            }

            let replicator = self.replicator.clone();
            let outcomes = self.outcomes.clone();
            let batch_size = self.batch_size;
            let task = tokio::spawn(async move {
                let result = replicator.push(channel, batch_size).await;
                let _ = outcomes.send(PushOutcome {
                    peer,
                    round,
                    result,
                });
            });
            session.push = Some(task);
        }
    }

    pub fn on_push_complete(&mut self, outcome: PushOutcome) {
        let Some(session) = self.sessions.get_mut(&outcome.peer) else {
            return;
        };
        let (round, link) = match session.state {
            SessionState::Replicating { round, link } if round == outcome.round => (round, link),
            _ => {
                debug!(
                    target = "replication",
                    peer = %outcome.peer,
                    round = outcome.round,
                    "push finished for a round that is no longer current"
                );
                return;
            }
        };
        session.push = None;
        match outcome.result {
            Ok(report) => {
                debug!(
                    target = "replication",
                    peer = %outcome.peer,
                    round = outcome.round,
                    documents = report.documents,
                    "push complete; awaiting acknowledgment"
                );
                session.state = SessionState::AwaitingAck {
                    round,
                    link,
                    since: Instant::now(),
                };
            }
            Err(err) => {
                warn!(
                    target = "replication",
                    peer = %outcome.peer,
                    round = outcome.round,
                    error = %err,
                    "replication push failed"
                );
                session.state = SessionState::Idle;
            }
        }
    }

    /// Handles one data-channel frame from a ready link to `peer`.
    pub async fn on_frame(&mut self, peer: &PeerId, link: LinkId, frame: Frame) {
        match Sentinel::parse(&frame) {
            Some(Sentinel::Replicating) => {
                debug!(target = "replication", peer = %peer, link = %link, "peer started a round");
            }
            Some(Sentinel::Received) => self.on_received(peer, link).await,
            Some(Sentinel::Sent) => match self.sessions.get_mut(peer) {
                Some(session) if session.awaiting_sent => {
                    session.awaiting_sent = false;
                    debug!(target = "replication", peer = %peer, link = %link, "peer confirmed our acknowledgment");
                }
                _ => {
                    debug!(target = "replication", peer = %peer, link = %link, "unexpected confirmation ignored");
                }
            },
            None => self.apply(peer, frame).await,
        }
    }

    async fn apply(&mut self, peer: &PeerId, frame: Frame) {
        match self.replicator.apply(peer, &frame).await {
            Ok(Inbound::Applied { .. }) => {}
            Ok(Inbound::EndPeerReplicate) => {
                let Some(session) = self.sessions.get_mut(peer) else {
                    return;
                };
                session.awaiting_sent = true;
                for (id, channel) in &session.links {
                    if let Err(err) = channel.send(Sentinel::Received.frame()).await {
                        warn!(target = "replication", peer = %peer, link = %id, error = %err, "failed to acknowledge round");
                    }
                }
                self.status
                    .report(StatusEvent::AcknowledgedReceive(peer.clone()));
            }
            Err(err) => {
                warn!(target = "replication", peer = %peer, error = %err, "replication frame rejected");
            }
        }
    }

    async fn on_received(&mut self, peer: &PeerId, link: LinkId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        let Some(round) = session.state.round() else {
            debug!(target = "replication", peer = %peer, link = %link, "duplicate acknowledgment ignored");
            return;
        };
        if session.state.link() != Some(link) {
            debug!(target = "replication", peer = %peer, link = %link, round, "acknowledgment on another link ignored");
            return;
        }
        // The push task may still be flushing its last frame; let it finish on its own.
        session.push = None;
        session.state = SessionState::Idle;
        session.rounds_acknowledged += 1;
        info!(target = "replication", peer = %peer, round, "round acknowledged");
        self.status.report(StatusEvent::AcknowledgedSent(peer.clone()));
        if let Some(channel) = session.links.get(&link) {
            if let Err(err) = channel.send(Sentinel::Sent.frame()).await {
                warn!(target = "replication", peer = %peer, link = %link, error = %err, "failed to confirm acknowledgment");
            }
        }
        self.request_compaction();
    }

    /// Starts a compaction unless one is already running.
    fn request_compaction(&self) {
        if self.compacting.swap(true, Ordering::SeqCst) {
            debug!(target = "replication", "compaction already running; skipped");
            return;
        }
        let store = self.store.clone();
        let compacting = self.compacting.clone();
        tokio::spawn(async move {
            match store.compact().await {
                Ok(report) => {
                    debug!(target = "replication", reclaimed = report.reclaimed, "compaction finished")
                }
                Err(err) => warn!(target = "replication", error = %err, "compaction failed"),
            }
            compacting.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusEvent;
    use crate::store::{MemoryStore, StreamReplicator};
    use crate::transport::TransportError;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct CapturingChannel {
        frames: Mutex<Vec<Frame>>,
    }

    impl CapturingChannel {
        fn sentinels(&self) -> Vec<Sentinel> {
            self.frames.lock().iter().filter_map(Sentinel::parse).collect()
        }
    }

    #[async_trait::async_trait]
    impl DataChannel for CapturingChannel {
        async fn send(&self, frame: Frame) -> Result<(), TransportError> {
            self.frames.lock().push(frame);
            Ok(())
        }

        async fn close(&self) {}

        fn label(&self) -> &str {
            "capture"
        }
    }

    struct Harness {
        coordinator: ReplicationCoordinator,
        store: Arc<MemoryStore>,
        outcomes: mpsc::UnboundedReceiver<PushOutcome>,
        status: broadcast::Receiver<StatusEvent>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let reporter = StatusReporter::new();
        let status = reporter.subscribe();
        let (tx, outcomes) = mpsc::unbounded_channel();
        let coordinator = ReplicationCoordinator::new(
            store.clone(),
            Arc::new(StreamReplicator::new(store.clone())),
            reporter,
            tx,
            50,
            Duration::from_secs(30),
        );
        Harness {
            coordinator,
            store,
            outcomes,
            status,
        }
    }

    fn drain(status: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = status.try_recv() {
            events.push(event);
        }
        events
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_round_compacts_exactly_once() {
        let mut h = harness();
        h.store.put("a", json!(1)).await.unwrap();
        h.store.put("a", json!(2)).await.unwrap();
        let peer = PeerId::from("b");
        let channel = Arc::new(CapturingChannel::default());

        h.coordinator
            .on_link_ready(peer.clone(), LinkId(1), channel.clone())
            .await;
        assert_eq!(
            drain(&mut h.status),
            vec![
                StatusEvent::Connected(peer.clone()),
                StatusEvent::Replicating(peer.clone())
            ]
        );
        let outcome = h.outcomes.recv().await.unwrap();
        h.coordinator.on_push_complete(outcome);
        assert!(matches!(
            h.coordinator.session(&peer).unwrap().state(),
            SessionState::AwaitingAck { .. }
        ));

        h.coordinator
            .on_frame(&peer, LinkId(1), Sentinel::Received.frame())
            .await;
        h.coordinator
            .on_frame(&peer, LinkId(1), Sentinel::Received.frame())
            .await;
        while h.store.compactions() == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.store.compactions(), 1);
        assert_eq!(
            drain(&mut h.status),
            vec![StatusEvent::AcknowledgedSent(peer.clone())]
        );
        assert_eq!(
            channel.sentinels(),
            vec![Sentinel::Replicating, Sentinel::Sent]
        );
        let session = h.coordinator.session(&peer).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.rounds_acknowledged(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn received_during_push_still_closes_the_round() {
        let mut h = harness();
        let peer = PeerId::from("b");
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(1), Arc::new(CapturingChannel::default()))
            .await;
        h.coordinator
            .on_frame(&peer, LinkId(1), Sentinel::Received.frame())
            .await;
        assert_eq!(
            h.coordinator.session(&peer).unwrap().state(),
            SessionState::Idle
        );
        // The late push report is for a round that is no longer current.
        let outcome = h.outcomes.recv().await.unwrap();
        h.coordinator.on_push_complete(outcome);
        assert_eq!(
            h.coordinator.session(&peer).unwrap().state(),
            SessionState::Idle
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn triggers_while_pending_are_noops() {
        let mut h = harness();
        let peer = PeerId::from("b");
        let channel = Arc::new(CapturingChannel::default());
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(1), channel.clone())
            .await;
        h.coordinator.replicate_all().await;
        h.coordinator.replicate_all().await;
        let replicating = drain(&mut h.status)
            .into_iter()
            .filter(|event| matches!(event, StatusEvent::Replicating(_)))
            .count();
        assert_eq!(replicating, 1);
        assert_eq!(channel.sentinels(), vec![Sentinel::Replicating]);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn overdue_acknowledgment_stops_blocking() {
        let mut h = harness();
        let peer = PeerId::from("b");
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(1), Arc::new(CapturingChannel::default()))
            .await;
        let outcome = h.outcomes.recv().await.unwrap();
        h.coordinator.on_push_complete(outcome);
        drain(&mut h.status);

        h.coordinator.replicate_all().await;
        assert!(drain(&mut h.status).is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        h.coordinator.replicate_all().await;
        assert_eq!(
            drain(&mut h.status),
            vec![StatusEvent::Replicating(peer.clone())]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn end_of_peer_push_is_acknowledged_on_every_link() {
        let mut h = harness();
        let peer = PeerId::from("b");
        let first = Arc::new(CapturingChannel::default());
        let second = Arc::new(CapturingChannel::default());
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(1), first.clone())
            .await;
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(2), second.clone())
            .await;
        drain(&mut h.status);

        h.coordinator
            .on_frame(
                &peer,
                LinkId(2),
                Frame::text(r#"{"kind":"batch","docs":[{"id":"x","rev":1,"body":7}]}"#),
            )
            .await;
        h.coordinator
            .on_frame(&peer, LinkId(2), Frame::text(r#"{"kind":"end","count":1}"#))
            .await;

        assert_eq!(h.store.get("x").await.unwrap().unwrap().body, json!(7));
        assert!(first.sentinels().contains(&Sentinel::Received));
        assert!(second.sentinels().contains(&Sentinel::Received));
        assert_eq!(
            drain(&mut h.status),
            vec![StatusEvent::AcknowledgedReceive(peer.clone())]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn acknowledgment_copies_on_other_links_do_not_close_the_next_round() {
        let mut h = harness();
        let peer = PeerId::from("b");
        let first = Arc::new(CapturingChannel::default());
        let second = Arc::new(CapturingChannel::default());
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(1), first.clone())
            .await;
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(2), second.clone())
            .await;
        let outcome = h.outcomes.recv().await.unwrap();
        h.coordinator.on_push_complete(outcome);

        // The peer acknowledges on both links; the copy on link 2 lags behind.
        h.coordinator
            .on_frame(&peer, LinkId(1), Sentinel::Received.frame())
            .await;
        h.coordinator.replicate_all().await;
        let next = h.coordinator.session(&peer).unwrap().state();
        assert!(matches!(
            next,
            SessionState::Replicating { round: 2, link: LinkId(1) }
        ));

        h.coordinator
            .on_frame(&peer, LinkId(2), Sentinel::Received.frame())
            .await;
        let session = h.coordinator.session(&peer).unwrap();
        assert_eq!(session.state(), next);
        assert_eq!(session.rounds_acknowledged(), 1);
        let acknowledged = drain(&mut h.status)
            .into_iter()
            .filter(|event| matches!(event, StatusEvent::AcknowledgedSent(_)))
            .count();
        assert_eq!(acknowledged, 1);
        assert!(!second.sentinels().contains(&Sentinel::Sent));

        h.coordinator
            .on_frame(&peer, LinkId(1), Sentinel::Received.frame())
            .await;
        let session = h.coordinator.session(&peer).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.rounds_acknowledged(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn closing_the_round_link_while_awaiting_ack_frees_the_session() {
        let mut h = harness();
        let peer = PeerId::from("b");
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(1), Arc::new(CapturingChannel::default()))
            .await;
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(2), Arc::new(CapturingChannel::default()))
            .await;
        let outcome = h.outcomes.recv().await.unwrap();
        h.coordinator.on_push_complete(outcome);

        h.coordinator.on_link_closed(&peer, LinkId(2));
        assert!(matches!(
            h.coordinator.session(&peer).unwrap().state(),
            SessionState::AwaitingAck { link: LinkId(1), .. }
        ));
        h.coordinator.on_link_closed(&peer, LinkId(1));
        assert!(h.coordinator.session(&peer).is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn acknowledged_peer_round_waits_for_its_confirmation() {
        let mut h = harness();
        let peer = PeerId::from("b");
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(1), Arc::new(CapturingChannel::default()))
            .await;
        assert!(!h.coordinator.session(&peer).unwrap().awaiting_confirmation());

        h.coordinator
            .on_frame(&peer, LinkId(1), Sentinel::Replicating.frame())
            .await;
        h.coordinator
            .on_frame(&peer, LinkId(1), Frame::text(r#"{"kind":"end","count":0}"#))
            .await;
        assert!(h.coordinator.session(&peer).unwrap().awaiting_confirmation());

        h.coordinator
            .on_frame(&peer, LinkId(1), Sentinel::Sent.frame())
            .await;
        assert!(!h.coordinator.session(&peer).unwrap().awaiting_confirmation());
        h.coordinator
            .on_frame(&peer, LinkId(1), Sentinel::Sent.frame())
            .await;
        assert!(!h.coordinator.session(&peer).unwrap().awaiting_confirmation());
    }

    #[test_timeout::tokio_timeout_test]
    async fn session_lives_exactly_as_long_as_its_links() {
        let mut h = harness();
        let peer = PeerId::from("b");
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(1), Arc::new(CapturingChannel::default()))
            .await;
        h.coordinator
            .on_link_ready(peer.clone(), LinkId(2), Arc::new(CapturingChannel::default()))
            .await;
        assert_eq!(h.coordinator.session(&peer).unwrap().link_count(), 2);

        h.coordinator.on_link_closed(&peer, LinkId(1));
        // The push was running over link 1, the lowest id.
        assert_eq!(
            h.coordinator.session(&peer).unwrap().state(),
            SessionState::Idle
        );
        h.coordinator.on_link_closed(&peer, LinkId(2));
        assert!(h.coordinator.session(&peer).is_none());
        h.coordinator.on_link_closed(&peer, LinkId(2));

        let disconnected = drain(&mut h.status)
            .into_iter()
            .filter(|event| matches!(event, StatusEvent::Disconnected(_)))
            .count();
        assert_eq!(disconnected, 2);
    }
}
