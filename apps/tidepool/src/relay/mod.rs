//! Connection to the signaling relay.
//!
//! A dialed relay is a pair of text queues: frames pushed into `outbound` are
//! written to the relay, frames read from it arrive on `inbound`. `inbound`
//! ends when the connection is lost; dropping `outbound` closes it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod websocket;

pub use memory::MemoryRelay;
pub use websocket::WebSocketDialer;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("invalid relay address {0:?}")]
    InvalidAddress(String),
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay connection closed")]
    Closed,
}

#[derive(Debug)]
pub struct RelayConnection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait RelayDialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<RelayConnection, RelayError>;
}

#[async_trait]
impl<T: RelayDialer + ?Sized> RelayDialer for Arc<T> {
    async fn dial(&self, address: &str) -> Result<RelayConnection, RelayError> {
        (**self).dial(address).await
    }
}
