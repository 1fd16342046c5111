//! The peer node: one task owning signaling, links, replication and the
//! reconnection policy, fed by channels.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::identity::PeerId;
use crate::protocol::LinkName;
use crate::reconnect::ReconnectPolicy;
use crate::relay::RelayDialer;
use crate::replication::{PushOutcome, ReplicationCoordinator, SessionState};
use crate::signaling::{DialOutcome, Dispatch, RelayEvent, RelayStatus, SignalingClient};
use crate::status::{StatusEvent, StatusReporter};
use crate::store::{Change, ChangeOrigin, DocumentStore, Replicator};
use crate::transport::{
    Connector, LinkEvent, LinkEventSender, LinkId, LinkRegistry, LinkSignal, NegotiationState,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("node has stopped")]
    Stopped,
}

/// Collaborators a node is built from.
pub struct NodeParts {
    pub dialer: Arc<dyn RelayDialer>,
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn DocumentStore>,
    pub replicator: Arc<dyn Replicator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSummary {
    pub id: LinkId,
    pub name: LinkName,
    pub peer: Option<PeerId>,
    pub state: NegotiationState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer: PeerId,
    pub links: Vec<LinkId>,
    pub state: SessionState,
    /// The peer's last round was acknowledged and its `<sent>` is still due.
    pub awaiting_confirmation: bool,
}

#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub local: PeerId,
    pub relay: RelayStatus,
    pub reconnect_pending: bool,
    pub links: Vec<LinkSummary>,
    pub sessions: Vec<SessionSummary>,
}

impl NodeSnapshot {
    pub fn ready_links(&self) -> impl Iterator<Item = &LinkSummary> {
        self.links
            .iter()
            .filter(|link| link.state == NegotiationState::Ready)
    }

    pub fn session(&self, peer: &PeerId) -> Option<&SessionSummary> {
        self.sessions.iter().find(|session| &session.peer == peer)
    }
}

enum Command {
    ReconnectNow,
    Snapshot(oneshot::Sender<NodeSnapshot>),
    Shutdown,
}

/// Command surface of a running node. Dropping every handle stops the node.
#[derive(Clone)]
pub struct NodeHandle {
    local: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    status: StatusReporter,
    store: Arc<dyn DocumentStore>,
}

impl NodeHandle {
    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Skips any pending reconnect delay and reopens the relay now.
    pub fn reconnect_now(&self) -> Result<(), NodeError> {
        self.commands
            .send(Command::ReconnectNow)
            .map_err(|_| NodeError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<NodeSnapshot, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct Mailbox {
    commands: mpsc::UnboundedReceiver<Command>,
    relay: mpsc::UnboundedReceiver<RelayEvent>,
    links: mpsc::UnboundedReceiver<LinkSignal>,
    outcomes: mpsc::UnboundedReceiver<PushOutcome>,
    timers: mpsc::UnboundedReceiver<u64>,
    changes: broadcast::Receiver<Change>,
}

pub struct Node {
    config: NodeConfig,
    signaling: SignalingClient,
    registry: LinkRegistry,
    coordinator: ReplicationCoordinator,
    reconnect: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    status: StatusReporter,
    link_tx: LinkEventSender,
    mailbox: Option<Mailbox>,
}

impl Node {
    pub fn new(config: NodeConfig, local: PeerId, parts: NodeParts) -> (Self, NodeHandle) {
        let NodeParts {
            dialer,
            connector,
            store,
            replicator,
        } = parts;
        let status = StatusReporter::new();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (relay_tx, relay) = mpsc::unbounded_channel();
        let (link_tx, links) = mpsc::unbounded_channel();
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let changes = store.changes();

        let handle = NodeHandle {
            local: local.clone(),
            commands: command_tx,
            status: status.clone(),
            store: store.clone(),
        };
        let node = Self {
            signaling: SignalingClient::new(local, config.relay_address.clone(), dialer, relay_tx),
            registry: LinkRegistry::new(),
            coordinator: ReplicationCoordinator::new(
                store,
                replicator,
                status.clone(),
                outcome_tx,
                config.batch_size,
                config.ack_timeout,
            ),
            reconnect: ReconnectPolicy::new(config.reconnect_delay, timer_tx),
            connector,
            status,
            link_tx,
            mailbox: Some(Mailbox {
                commands,
                relay,
                links,
                outcomes,
                timers,
                changes,
            }),
            config,
        };
        (node, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let Some(mut mailbox) = self.mailbox.take() else {
            return;
        };
        info!(
            peer = %self.signaling.local(),
            relay = %self.signaling.address(),
            "node starting"
        );
        self.signaling.open_relay();
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut changes_open = true;

        loop {
            tokio::select! {
                command = mailbox.commands.recv() => match command {
                    Some(Command::ReconnectNow) => {
                        info!(target = "relay", "manual reconnect requested");
                        self.reconnect_relay().await;
                    }
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = mailbox.relay.recv() => self.on_relay_event(event).await,
                Some(signal) = mailbox.links.recv() => self.on_link_signal(signal).await,
                Some(outcome) = mailbox.outcomes.recv() => self.coordinator.on_push_complete(outcome),
                Some(generation) = mailbox.timers.recv() => {
                    if self.reconnect.fire(generation) {
                        info!(target = "relay", "reconnect delay elapsed");
                        self.reconnect_relay().await;
                    }
                }
                change = mailbox.changes.recv(), if changes_open => match change {
                    Ok(Change { origin: ChangeOrigin::Local, document }) => {
                        debug!(target = "replication", id = %document.id, rev = document.rev, "local change");
                        self.coordinator.replicate_all().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target = "replication", skipped, "change stream lagged");
                        self.coordinator.replicate_all().await;
                    }
                    Err(RecvError::Closed) => changes_open = false,
                },
                _ = sweep.tick() => self.sweep().await,
            }
            if self.signaling.take_reconnect_request() {
                self.reconnect_relay().await;
            }
        }

        self.stop().await;
    }

    fn signaling_parts(&mut self) -> (&mut SignalingClient, Dispatch<'_>) {
        (
            &mut self.signaling,
            Dispatch {
                registry: &mut self.registry,
                connector: self.connector.as_ref(),
                links: &self.link_tx,
                status: &self.status,
            },
        )
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Dialed { epoch, result } => match self.signaling.on_dialed(epoch, result) {
                DialOutcome::Opened => {
                    self.reconnect.cancel();
                    self.status.report(StatusEvent::RelayConnected);
                    let announce_offer = self.config.announce_offer;
                    let (signaling, ctx) = self.signaling_parts();
                    signaling.announce(ctx, announce_offer).await;
                }
                DialOutcome::Failed(err) => {
                    warn!(target = "relay", error = %err, "relay dial failed");
                    self.on_relay_lost().await;
                }
                DialOutcome::Stale => {}
            },
            RelayEvent::Text { epoch, text } => {
                if let Some(message) = self.signaling.on_text(epoch, &text) {
                    let (signaling, ctx) = self.signaling_parts();
                    signaling.dispatch(message, ctx).await;
                }
            }
            RelayEvent::Closed { epoch } => {
                if self.signaling.on_closed(epoch) {
                    self.on_relay_lost().await;
                }
            }
        }
    }

    async fn on_relay_lost(&mut self) {
        self.status.report(StatusEvent::RelayDisconnected);
        // Negotiations cannot finish without the relay.
        self.discard_pending().await;
        self.reconnect.schedule();
    }

    /// Drops pending negotiations and reopens the relay; ready links stay up.
    async fn reconnect_relay(&mut self) {
        self.reconnect.cancel();
        self.discard_pending().await;
        self.signaling.reset();
        self.signaling.open_relay();
    }

    async fn discard_pending(&mut self) {
        for link in self.registry.discard_pending().await {
            debug!(target = "link", link = %link.id(), conn = %link.name(), "pending negotiation discarded");
            if let Some(peer) = link.peer() {
                self.status.report(StatusEvent::Disconnected(peer.clone()));
            }
        }
    }

    async fn on_link_signal(&mut self, signal: LinkSignal) {
        let LinkSignal { link: id, event } = signal;
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                self.signaling.send_candidate(&self.registry, id, candidate);
            }
            LinkEvent::Open(channel) => {
                let Some(link) = self.registry.get_mut(id) else {
                    debug!(target = "link", link = %id, "channel opened on a discarded link");
                    channel.close().await;
                    return;
                };
                let Some(peer) = link.peer().cloned() else {
                    warn!(target = "link", link = %id, "channel opened before the peer was known");
                    self.close_link(id, Some("unbound link opened")).await;
                    return;
                };
                if let Err(err) = link.mark_ready(channel.clone()) {
                    warn!(target = "link", link = %id, error = %err, "unexpected channel open");
                    return;
                }
                info!(target = "link", link = %id, peer = %peer, conn = %link.name(), "link ready");
                self.coordinator.on_link_ready(peer, id, channel).await;
            }
            LinkEvent::Message(frame) => {
                let Some(peer) = self
                    .registry
                    .get(id)
                    .filter(|link| link.is_ready())
                    .and_then(|link| link.peer().cloned())
                else {
                    trace!(target = "link", link = %id, "frame on a link that is not ready dropped");
                    return;
                };
                self.coordinator.on_frame(&peer, id, frame).await;
            }
            LinkEvent::Closed => self.close_link(id, None).await,
            LinkEvent::Failed(reason) => self.close_link(id, Some(reason.as_str())).await,
        }
    }

    async fn close_link(&mut self, id: LinkId, reason: Option<&str>) {
        let was_ready = self.registry.get(id).is_some_and(|link| link.is_ready());
        let Some(link) = self.registry.close(id).await else {
            return;
        };
        match reason {
            Some(reason) => warn!(target = "link", link = %id, conn = %link.name(), reason, "link failed"),
            None => info!(target = "link", link = %id, conn = %link.name(), "link closed"),
        }
        let Some(peer) = link.peer() else {
            return;
        };
        if was_ready {
            self.coordinator.on_link_closed(peer, id);
        } else {
            self.status.report(StatusEvent::Disconnected(peer.clone()));
        }
    }

    async fn sweep(&mut self) {
        for id in self
            .registry
            .expired(self.config.negotiation_timeout, Instant::now())
        {
            self.close_link(id, Some("negotiation timed out")).await;
        }
    }

    fn snapshot(&self) -> NodeSnapshot {
        let mut links: Vec<LinkSummary> = self
            .registry
            .links()
            .map(|link| LinkSummary {
                id: link.id(),
                name: link.name().clone(),
                peer: link.peer().cloned(),
                state: link.state(),
            })
            .collect();
        links.sort_by_key(|link| link.id);
        NodeSnapshot {
            local: self.signaling.local().clone(),
            relay: self.signaling.status(),
            reconnect_pending: self.reconnect.is_scheduled(),
            links,
            sessions: self
                .coordinator
                .sessions()
                .map(|session| SessionSummary {
                    peer: session.peer().clone(),
                    links: session.links().collect(),
                    state: session.state(),
                    awaiting_confirmation: session.awaiting_confirmation(),
                })
                .collect(),
        }
    }

    async fn stop(&mut self) {
        let ids: Vec<LinkId> = self.registry.links().map(|link| link.id()).collect();
        for id in ids {
            self.registry.close(id).await;
        }
        self.reconnect.cancel();
        self.signaling.reset();
        info!(peer = %self.signaling.local(), "node stopped");
    }
}
