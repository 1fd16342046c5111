//! Relay connection ownership and negotiation message dispatch.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::identity::PeerId;
use crate::protocol::{LinkName, Signal, SignalingMessage};
use crate::relay::{RelayConnection, RelayDialer, RelayError};
use crate::status::{StatusEvent, StatusReporter};
use crate::transport::{
    CandidateOutcome, Connector, LinkEventSender, LinkId, LinkRegistry, Resolution,
    TransportError,
};

/// Relay activity reported back to the event loop. `epoch` identifies the
/// connection attempt; events from a superseded attempt are ignored.
#[derive(Debug)]
pub enum RelayEvent {
    Dialed {
        epoch: u64,
        result: Result<RelayConnection, RelayError>,
    },
    Text {
        epoch: u64,
        text: String,
    },
    Closed {
        epoch: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Idle,
    Connecting,
    Open,
}

enum RelayState {
    Idle,
    Connecting,
    Open { outbound: mpsc::UnboundedSender<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Held until the pending connection opens.
    Queued,
    /// The relay was not usable; a full reconnect was requested.
    Stale,
    Unencodable,
}

#[derive(Debug)]
pub enum DialOutcome {
    Opened,
    Failed(RelayError),
    Stale,
}

/// What dispatch needs from the rest of the node.
pub struct Dispatch<'a> {
    pub registry: &'a mut LinkRegistry,
    pub connector: &'a dyn Connector,
    pub links: &'a LinkEventSender,
    pub status: &'a StatusReporter,
}

pub struct SignalingClient {
    local: PeerId,
    address: String,
    dialer: Arc<dyn RelayDialer>,
    events: mpsc::UnboundedSender<RelayEvent>,
    epoch: u64,
    state: RelayState,
    outbox: VecDeque<String>,
    reconnect_requested: bool,
}

impl SignalingClient {
    pub fn new(
        local: PeerId,
        address: impl Into<String>,
        dialer: Arc<dyn RelayDialer>,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Self {
        Self {
            local,
            address: address.into(),
            dialer,
            events,
            epoch: 0,
            state: RelayState::Idle,
            outbox: VecDeque::new(),
            reconnect_requested: false,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> RelayStatus {
        match self.state {
            RelayState::Idle => RelayStatus::Idle,
            RelayState::Connecting => RelayStatus::Connecting,
            RelayState::Open { .. } => RelayStatus::Open,
        }
    }

    /// Starts dialing unless a connection is open or already being dialed.
    pub fn open_relay(&mut self) -> bool {
        if !matches!(self.state, RelayState::Idle) {
            trace!(target = "signaling", "relay already open or connecting");
            return false;
        }
        self.epoch += 1;
        let epoch = self.epoch;
        self.state = RelayState::Connecting;
        let dialer = self.dialer.clone();
        let address = self.address.clone();
        let events = self.events.clone();
        info!(target = "signaling", address = %address, epoch, "dialing relay");
        tokio::spawn(async move {
            let result = dialer.dial(&address).await;
            let _ = events.send(RelayEvent::Dialed { epoch, result });
        });
        true
    }

    pub fn on_dialed(
        &mut self,
        epoch: u64,
        result: Result<RelayConnection, RelayError>,
    ) -> DialOutcome {
        if epoch != self.epoch || !matches!(self.state, RelayState::Connecting) {
            debug!(target = "signaling", epoch, "stale relay dial result dropped");
            return DialOutcome::Stale;
        }
        let RelayConnection {
            outbound,
            mut inbound,
        } = match result {
            Ok(connection) => connection,
            Err(err) => {
                self.state = RelayState::Idle;
                if !self.outbox.is_empty() {
                    warn!(
                        target = "signaling",
                        dropped = self.outbox.len(),
                        "relay dial failed; queued messages dropped"
                    );
                    self.outbox.clear();
                }
                return DialOutcome::Failed(err);
            }
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                if events.send(RelayEvent::Text { epoch, text }).is_err() {
                    return;
                }
            }
            let _ = events.send(RelayEvent::Closed { epoch });
        });

        let queued = self.outbox.len();
        for text in self.outbox.drain(..) {
            let _ = outbound.send(text);
        }
        self.state = RelayState::Open { outbound };
        info!(target = "signaling", epoch, flushed = queued, "relay open");
        DialOutcome::Opened
    }

    /// Returns true when the current connection was lost.
    pub fn on_closed(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || matches!(self.state, RelayState::Idle) {
            return false;
        }
        self.state = RelayState::Idle;
        warn!(target = "signaling", epoch, "relay connection lost");
        true
    }

    /// Drops the current connection, if any, without reporting it as lost.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.state = RelayState::Idle;
        self.outbox.clear();
        self.reconnect_requested = false;
    }

    pub fn take_reconnect_request(&mut self) -> bool {
        std::mem::take(&mut self.reconnect_requested)
    }

    pub fn send(&mut self, mut message: SignalingMessage) -> SendOutcome {
        message.from = self.local.clone();
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(target = "signaling", error = %err, "failed to encode signaling message");
                return SendOutcome::Unencodable;
            }
        };
        match &self.state {
            RelayState::Open { outbound } => {
                if outbound.send(text).is_ok() {
                    trace!(
                        target = "signaling",
                        action = %message.signal.action(),
                        conn = %message.conn,
                        "sent"
                    );
                    return SendOutcome::Sent;
                }
                self.state = RelayState::Idle;
            }
            RelayState::Connecting => {
                self.outbox.push_back(text);
                return SendOutcome::Queued;
            }
            RelayState::Idle => {}
        }
        warn!(
            target = "signaling",
            action = %message.signal.action(),
            conn = %message.conn,
            to = ?message.to.as_ref().map(PeerId::as_str),
            "relay not open; message dropped, reconnecting"
        );
        self.reconnect_requested = true;
        SendOutcome::Stale
    }

    /// Decodes one relay frame, dropping our own echoes, messages addressed
    /// to someone else and anything malformed.
    pub fn on_text(&self, epoch: u64, text: &str) -> Option<SignalingMessage> {
        if epoch != self.epoch {
            return None;
        }
        let message = match SignalingMessage::decode(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(target = "signaling", error = %err, "malformed signaling message discarded");
                return None;
            }
        };
        if message.from == self.local {
            trace!(target = "signaling", action = %message.signal.action(), "own echo suppressed");
            return None;
        }
        if message.to.as_ref().is_some_and(|to| *to != self.local) {
            trace!(target = "signaling", from = %message.from, "message for another peer ignored");
            return None;
        }
        Some(message)
    }

    /// Broadcasts presence, plus an open offer when `announce_offer` is set.
    pub async fn announce(&mut self, ctx: Dispatch<'_>, announce_offer: bool) {
        self.send(SignalingMessage::notify());
        if announce_offer {
            self.connect_to(None, ctx).await;
        }
    }

    /// Creates an initiator link and sends its offer, to `peer` or to anyone.
    pub async fn connect_to(&mut self, peer: Option<PeerId>, ctx: Dispatch<'_>) -> Option<LinkId> {
        let id = match ctx
            .registry
            .create_outbound(peer.clone(), ctx.connector, ctx.links)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                warn!(target = "signaling", peer = ?peer, error = %err, "could not create outbound link");
                return None;
            }
        };
        if let Some(peer) = &peer {
            ctx.status.report(StatusEvent::Connecting(peer.clone()));
        }
        let link = ctx.registry.get_mut(id)?;
        let name = link.name().clone();
        match link.start_offer().await {
            Ok(offer) => {
                debug!(target = "signaling", link = %id, conn = %name, peer = ?peer, "offer created");
                self.send(SignalingMessage::new(name, Signal::Offer(offer)).addressed_to(peer));
                Some(id)
            }
            Err(err) => {
                fail_link(ctx, id, err).await;
                None
            }
        }
    }

    pub fn send_candidate(&mut self, registry: &LinkRegistry, link: LinkId, candidate: Value) {
        let Some(link) = registry.get(link) else {
            trace!(target = "signaling", link = %link, "candidate for a discarded link dropped");
            return;
        };
        let message = SignalingMessage::new(link.name().clone(), Signal::Candidate(candidate))
            .addressed_to(link.peer().cloned());
        self.send(message);
    }

    pub async fn dispatch(&mut self, message: SignalingMessage, ctx: Dispatch<'_>) {
        let SignalingMessage {
            from, conn, signal, ..
        } = message;
        debug!(target = "signaling", from = %from, conn = %conn, action = %signal.action(), "dispatch");
        match signal {
            Signal::Notify => {
                self.connect_to(Some(from), ctx).await;
            }
            Signal::Offer(offer) => self.on_offer(from, conn, offer, ctx).await,
            Signal::Answer(answer) => on_answer(from, conn, answer, ctx).await,
            Signal::Candidate(candidate) => on_candidate(from, conn, candidate, ctx).await,
        }
    }

    async fn on_offer(&mut self, from: PeerId, conn: LinkName, offer: Value, mut ctx: Dispatch<'_>) {
        let Some(id) = resolve(&from, &conn, &mut ctx).await else {
            return;
        };
        let Some(link) = ctx.registry.get_mut(id) else {
            return;
        };
        match link.accept_offer(offer).await {
            Ok(answer) => {
                self.send(
                    SignalingMessage::new(conn, Signal::Answer(answer)).addressed_to(Some(from)),
                );
            }
            Err(TransportError::InvalidState(what)) => {
                warn!(target = "signaling", from = %from, conn = %conn, "offer ignored: {what}");
            }
            Err(err) => fail_link(ctx, id, err).await,
        }
    }
}

/// Finds or creates the link for `(from, conn)`, reporting a new negotiation.
async fn resolve(from: &PeerId, conn: &LinkName, ctx: &mut Dispatch<'_>) -> Option<LinkId> {
    match ctx
        .registry
        .resolve(from, conn, ctx.connector, ctx.links)
        .await
    {
        Ok(resolution) => {
            if !matches!(resolution, Resolution::Existing(_)) {
                ctx.status.report(StatusEvent::Connecting(from.clone()));
            }
            Some(resolution.id())
        }
        Err(err) => {
            warn!(target = "signaling", from = %from, conn = %conn, error = %err, "could not create link");
            None
        }
    }
}

async fn on_answer(from: PeerId, conn: LinkName, answer: Value, ctx: Dispatch<'_>) {
    let Some(resolution) = ctx.registry.bind(&from, &conn) else {
        debug!(target = "signaling", from = %from, conn = %conn, "answer for unknown link dropped");
        return;
    };
    if let Resolution::Rebound(_) = resolution {
        ctx.status.report(StatusEvent::Connecting(from.clone()));
    }
    let id = resolution.id();
    let Some(link) = ctx.registry.get_mut(id) else {
        return;
    };
    match link.accept_answer(answer).await {
        Ok(()) => debug!(target = "signaling", from = %from, conn = %conn, "answer applied"),
        Err(TransportError::InvalidState(what)) => {
            warn!(target = "signaling", from = %from, conn = %conn, "answer ignored: {what}");
        }
        Err(err) => fail_link(ctx, id, err).await,
    }
}

async fn on_candidate(from: PeerId, conn: LinkName, candidate: Value, mut ctx: Dispatch<'_>) {
    let Some(id) = resolve(&from, &conn, &mut ctx).await else {
        return;
    };
    let Some(link) = ctx.registry.get_mut(id) else {
        return;
    };
    match link.apply_candidate(candidate).await {
        Ok(CandidateOutcome::Applied) => {
            trace!(target = "signaling", from = %from, conn = %conn, "candidate applied")
        }
        Ok(CandidateOutcome::Buffered) => {}
        Err(err) => {
            warn!(target = "signaling", from = %from, conn = %conn, error = %err, "candidate rejected")
        }
    }
}

/// Removes a link whose negotiation failed.
async fn fail_link(ctx: Dispatch<'_>, id: LinkId, err: TransportError) {
    let Some(link) = ctx.registry.close(id).await else {
        return;
    };
    warn!(
        target = "signaling",
        link = %id,
        conn = %link.name(),
        error = %err,
        "negotiation failed; link removed"
    );
    if let Some(peer) = link.peer() {
        ctx.status.report(StatusEvent::Disconnected(peer.clone()));
    }
}
