use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{RelayConnection, RelayDialer, RelayError};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Dials relays over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Clone, Default)]
pub struct WebSocketDialer;

impl WebSocketDialer {
    pub fn new() -> Self {
        Self
    }
}

fn relay_url(address: &str) -> Result<Url, RelayError> {
    let url = Url::parse(address).map_err(|_| RelayError::InvalidAddress(address.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        _ => Err(RelayError::InvalidAddress(address.to_string())),
    }
}

#[async_trait]
impl RelayDialer for WebSocketDialer {
    async fn dial(&self, address: &str) -> Result<RelayConnection, RelayError> {
        let url = relay_url(address)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| RelayError::Connect(err.to_string()))?;
        tracing::debug!(target = "relay", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();
        let (reader_done, mut reader_done_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => {
                        let Some(text) = message else { break };
                        tracing::trace!(target = "relay", event = "ws_out", len = text.len());
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    _ = keepalive.tick() => {
                        if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut reader_done_rx => break,
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(target = "relay", event = "ws_in", len = text.len());
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => {
                            if inbound_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            tracing::warn!(target = "relay", "dropping non-utf8 binary relay frame")
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "relay", "relay websocket closed: {err}");
                            }
                            _ => tracing::warn!(target = "relay", "relay websocket error: {err}"),
                        }
                        break;
                    }
                }
            }
            let _ = reader_done.send(());
        });

        Ok(RelayConnection { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn only_websocket_schemes_are_accepted() {
        assert!(relay_url("ws://127.0.0.1:8080/subnet/a").is_ok());
        assert!(relay_url("wss://relay.example/subnet/a").is_ok());
        assert_eq!(
            relay_url("http://relay.example/").unwrap_err(),
            RelayError::InvalidAddress("http://relay.example/".into())
        );
        assert!(relay_url("not a url").is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn refused_connection_is_a_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = WebSocketDialer::new()
            .dial(&format!("ws://127.0.0.1:{port}/subnet/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Connect(_)));
    }
}
