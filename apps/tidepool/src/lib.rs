pub mod config;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod reconnect;
pub mod relay;
pub mod replication;
pub mod signaling;
pub mod state;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use config::NodeConfig;
pub use identity::PeerId;
pub use node::{Node, NodeError, NodeHandle, NodeParts, NodeSnapshot};
pub use status::StatusEvent;
