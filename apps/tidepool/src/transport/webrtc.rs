//! Production connector on top of the `webrtc` crate.
//!
//! Descriptions and candidates are exchanged as the browser JSON shapes
//! (`{"type","sdp"}` and `{"candidate","sdpMid","sdpMLineIndex"}`), so a
//! native node can negotiate with a browser peer on the same relay.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    Connector, DataChannel, LinkEvent, LinkEventSender, LinkId, LinkSignal, PeerConnection,
    TransportError,
};
use crate::config::NodeConfig;
use crate::protocol::Frame;

pub struct RtcConnector {
    api: API,
    ice_servers: Vec<String>,
    label: String,
}

impl RtcConnector {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            api: APIBuilder::new().build(),
            ice_servers: config.ice_servers.clone(),
            label: config.channel_label.clone(),
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Connector for RtcConnector {
    async fn connect(
        &self,
        link: LinkId,
        events: LinkEventSender,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|err| TransportError::Setup(err.to_string()))?,
        );

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                // `None` marks the end of gathering; the relay protocol has no message for it.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json().map(|init| serde_json::to_value(init)) {
                    Ok(Ok(value)) => {
                        let _ = events.send(LinkSignal {
                            link,
                            event: LinkEvent::LocalCandidate(value),
                        });
                    }
                    Ok(Err(err)) => warn!(target = "link", link = %link, error = %err, "candidate encode failed"),
                    Err(err) => warn!(target = "link", link = %link, error = %err, "candidate export failed"),
                }
            })
        }));

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    debug!(target = "link", link = %link, ?state, "peer connection state changed");
                    if state == RTCPeerConnectionState::Failed {
                        let _ = events.send(LinkSignal {
                            link,
                            event: LinkEvent::Failed("peer connection failed".into()),
                        });
                    }
                })
            },
        ));

        let channel_events = events.clone();
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                debug!(target = "link", link = %link, label = channel.label(), "remote data channel announced");
                wire_channel(link, channel, events);
            })
        }));

        Ok(Box::new(RtcConnection {
            link,
            label: self.label.clone(),
            events,
            peer_connection,
        }))
    }
}

struct RtcConnection {
    link: LinkId,
    label: String,
    events: LinkEventSender,
    peer_connection: Arc<RTCPeerConnection>,
}

fn negotiation(err: webrtc::Error) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

fn encode_description(description: &RTCSessionDescription) -> Result<Value, TransportError> {
    serde_json::to_value(description).map_err(|err| TransportError::Negotiation(err.to_string()))
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn create_offer(&self) -> Result<Value, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .peer_connection
            .create_data_channel(&self.label, Some(init))
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        wire_channel(self.link, channel, self.events.clone());

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(negotiation)?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        encode_description(&offer)
    }

    async fn create_answer(&self) -> Result<Value, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(negotiation)?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        encode_description(&answer)
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), TransportError> {
        let description: RTCSessionDescription = serde_json::from_value(description)
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(negotiation)
    }

    async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(negotiation)
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            trace!(target = "link", link = %self.link, error = %err, "peer connection close failed");
        }
    }
}

fn wire_channel(link: LinkId, channel: Arc<RTCDataChannel>, events: LinkEventSender) {
    let open_events = events.clone();
    let open_channel = channel.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            let wrapped: Arc<dyn DataChannel> = Arc::new(RtcDataChannel {
                label: open_channel.label().to_string(),
                channel: open_channel,
            });
            let _ = open_events.send(LinkSignal {
                link,
                event: LinkEvent::Open(wrapped),
            });
        })
    }));

    let message_events = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let frame = if message.is_string {
                match String::from_utf8(message.data.to_vec()) {
                    Ok(text) => Frame::Text(text),
                    Err(_) => Frame::Binary(message.data),
                }
            } else {
                Frame::Binary(message.data)
            };
            let _ = events.send(LinkSignal {
                link,
                event: LinkEvent::Message(frame),
            });
        })
    }));

    let close_events = events.clone();
    channel.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            let _ = events.send(LinkSignal {
                link,
                event: LinkEvent::Closed,
            });
        })
    }));

    channel.on_error(Box::new(move |err: webrtc::Error| {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(LinkSignal {
                link,
                event: LinkEvent::Failed(err.to_string()),
            });
        })
    }));
}

struct RtcDataChannel {
    label: String,
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let result = match frame {
            Frame::Text(text) => self.channel.send_text(text).await,
            Frame::Binary(bytes) => self.channel.send(&bytes).await,
        };
        result
            .map(|_| ())
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn close(&self) {
        let _ = self.channel.close().await;
    }

    fn label(&self) -> &str {
        &self.label
    }
}
