//! Wire formats: relay signaling messages and data-channel frames.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::identity::PeerId;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid signaling json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signaling message missing `from`")]
    MissingSender,
    #[error("{0} message missing `data`")]
    MissingData(Action),
}

/// Name of one negotiated link, chosen by the side that sends the offer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct LinkName(String);

impl LinkName {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(format!("conn-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LinkName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Notify,
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Notify => "notify",
            Action::Offer => "offer",
            Action::Answer => "answer",
            Action::Candidate => "candidate",
        })
    }
}

/// Negotiation payload. Descriptions and candidates stay opaque JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Notify,
    Offer(Value),
    Answer(Value),
    Candidate(Value),
}

impl Signal {
    pub fn action(&self) -> Action {
        match self {
            Signal::Notify => Action::Notify,
            Signal::Offer(_) => Action::Offer,
            Signal::Answer(_) => Action::Answer,
            Signal::Candidate(_) => Action::Candidate,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    pub from: PeerId,
    pub to: Option<PeerId>,
    pub conn: LinkName,
    pub signal: Signal,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default)]
    from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default)]
    conn: String,
    action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl SignalingMessage {
    pub fn new(conn: LinkName, signal: Signal) -> Self {
        Self {
            from: PeerId::new(String::new()),
            to: None,
            conn,
            signal,
        }
    }

    pub fn notify() -> Self {
        Self::new(LinkName::default(), Signal::Notify)
    }

    pub fn addressed_to(mut self, peer: Option<PeerId>) -> Self {
        self.to = peer;
        self
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = match &self.signal {
            Signal::Notify => None,
            Signal::Offer(value) | Signal::Answer(value) | Signal::Candidate(value) => {
                Some(value.clone())
            }
        };
        let wire = WireMessage {
            from: self.from.as_str().to_string(),
            to: self.to.as_ref().map(|peer| peer.as_str().to_string()),
            conn: self.conn.as_str().to_string(),
            action: self.signal.action(),
            data,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireMessage = serde_json::from_str(text)?;
        if wire.from.trim().is_empty() {
            return Err(ProtocolError::MissingSender);
        }
        let data = wire.data.filter(|value| !value.is_null());
        let signal = match wire.action {
            Action::Notify => Signal::Notify,
            Action::Offer => Signal::Offer(data.ok_or(ProtocolError::MissingData(Action::Offer))?),
            Action::Answer => {
                Signal::Answer(data.ok_or(ProtocolError::MissingData(Action::Answer))?)
            }
            Action::Candidate => {
                Signal::Candidate(data.ok_or(ProtocolError::MissingData(Action::Candidate))?)
            }
        };
        Ok(Self {
            from: PeerId::from(wire.from),
            to: wire.to.filter(|to| !to.is_empty()).map(PeerId::from),
            conn: LinkName::new(wire.conn),
            signal,
        })
    }
}

/// One application message on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn text(value: impl Into<String>) -> Self {
        Frame::Text(value.into())
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handshake tokens sequencing replication rounds over a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Replicating,
    Received,
    Sent,
}

impl Sentinel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Sentinel::Replicating => "<replicating>",
            Sentinel::Received => "<received>",
            Sentinel::Sent => "<sent>",
        }
    }

    /// Exact match only; anything else belongs to the replication stream.
    pub fn parse(frame: &Frame) -> Option<Sentinel> {
        let Frame::Text(text) = frame else {
            return None;
        };
        match text.as_str() {
            "<replicating>" => Some(Sentinel::Replicating),
            "<received>" => Some(Sentinel::Received),
            "<sent>" => Some(Sentinel::Sent),
            _ => None,
        }
    }

    pub fn frame(self) -> Frame {
        Frame::text(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn decodes_browser_style_offer() {
        let text = r#"{"from":"misty-river-0001","conn":"conn-42","action":"offer","data":{"type":"offer","sdp":"v=0"}}"#;
        let message = SignalingMessage::decode(text).unwrap();
        assert_eq!(message.from.as_str(), "misty-river-0001");
        assert_eq!(message.conn.as_str(), "conn-42");
        assert_eq!(message.to, None);
        assert_eq!(
            message.signal,
            Signal::Offer(json!({"type": "offer", "sdp": "v=0"}))
        );
    }

    #[test_timeout::timeout]
    fn notify_omits_data() {
        let mut message = SignalingMessage::notify();
        message.from = PeerId::from("a");
        let text = message.encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["action"], "notify");
        assert!(value.get("data").is_none());
        assert!(value.get("to").is_none());
    }

    #[test_timeout::timeout]
    fn candidate_without_data_is_malformed() {
        let err = SignalingMessage::decode(r#"{"from":"a","conn":"c","action":"candidate"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingData(Action::Candidate)));
    }

    #[test_timeout::timeout]
    fn unknown_action_and_missing_sender_are_rejected() {
        assert!(SignalingMessage::decode(r#"{"from":"a","conn":"c","action":"bye"}"#).is_err());
        assert!(matches!(
            SignalingMessage::decode(r#"{"conn":"c","action":"notify"}"#),
            Err(ProtocolError::MissingSender)
        ));
        assert!(SignalingMessage::decode("not json").is_err());
    }

    #[test_timeout::timeout]
    fn addressed_messages_carry_to() {
        let mut message =
            SignalingMessage::new(LinkName::from("conn-1"), Signal::Answer(json!({"sdp": "x"})))
                .addressed_to(Some(PeerId::from("b")));
        message.from = PeerId::from("a");
        let decoded = SignalingMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test_timeout::timeout]
    fn sentinels_match_exactly() {
        assert_eq!(
            Sentinel::parse(&Frame::text("<received>")),
            Some(Sentinel::Received)
        );
        assert_eq!(Sentinel::parse(&Frame::text(" <received>")), None);
        assert_eq!(
            Sentinel::parse(&Frame::Binary(Bytes::from_static(b"<sent>"))),
            None
        );
        assert_eq!(Sentinel::Replicating.frame(), Frame::text("<replicating>"));
    }

    #[test_timeout::timeout]
    fn generated_link_names_are_distinct() {
        assert_ne!(LinkName::generate(), LinkName::generate());
    }
}
