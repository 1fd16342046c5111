use std::env;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Deliver each frame back to its sender as well as to the other members.
    pub echo: bool,
    /// Frames larger than this are dropped instead of forwarded.
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            echo: true,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("TIDEPOOL_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            echo: env::var("TIDEPOOL_RELAY_ECHO")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.echo),
            max_message_bytes: env::var("TIDEPOOL_RELAY_MAX_MESSAGE_BYTES")
                .ok()
                .and_then(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_message_bytes),
        }
    }
}
