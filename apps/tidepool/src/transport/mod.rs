//! Direct peer links and the seams used to build them.
//!
//! A [`Connector`] produces [`PeerConnection`]s; each connection reports what
//! happens to it (local candidates, channel open, messages, close) as
//! [`LinkSignal`]s tagged with the local [`LinkId`] it was created for.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Frame;

pub mod link;
pub mod memory;
pub mod registry;
pub mod webrtc;

pub use link::{CandidateOutcome, LinkRole, NegotiationState, TransportLink};
pub use registry::{LinkKey, LinkRegistry, Resolution};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("link is not in a state that allows {0}")]
    InvalidState(&'static str),
    #[error("data channel closed")]
    ChannelClosed,
    #[error("send failed: {0}")]
    Send(String),
}

/// Process-local handle of a transport link; stable across re-keying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

pub enum LinkEvent {
    LocalCandidate(Value),
    Open(Arc<dyn DataChannel>),
    Message(Frame),
    Closed,
    Failed(String),
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            LinkEvent::Open(channel) => f.debug_tuple("Open").field(&channel.label()).finish(),
            LinkEvent::Message(frame) => f.debug_tuple("Message").field(&frame.len()).finish(),
            LinkEvent::Closed => f.write_str("Closed"),
            LinkEvent::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

#[derive(Debug)]
pub struct LinkSignal {
    pub link: LinkId,
    pub event: LinkEvent,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkSignal>;

/// Message channel of a link once it is ready.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    async fn close(&self);

    fn label(&self) -> &str;
}

/// One side of a direct connection while it is being negotiated.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Opens the data channel and returns the local offer description.
    async fn create_offer(&self) -> Result<Value, TransportError>;

    /// Returns the local answer; the remote offer must already be applied.
    async fn create_answer(&self) -> Result<Value, TransportError>;

    async fn set_remote_description(&self, description: Value) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        link: LinkId,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerConnection>, TransportError>;
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for Arc<T> {
    async fn connect(
        &self,
        link: LinkId,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        (**self).connect(link, events).await
    }
}
