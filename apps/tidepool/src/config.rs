use std::env;
use std::time::Duration;

pub const DEFAULT_RELAY_BASE: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(120);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_CHANNEL_LABEL: &str = "main-channel";

const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
];

/// Runtime knobs of one peer node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Relay endpoint for the channel this node joins.
    pub relay_address: String,
    /// Fixed delay before the single reconnection attempt after relay loss.
    pub reconnect_delay: Duration,
    /// Links still negotiating after this long are reaped.
    pub negotiation_timeout: Duration,
    /// A replication round awaiting `<received>` longer than this no longer blocks new rounds.
    pub ack_timeout: Duration,
    /// Documents per replication frame.
    pub batch_size: usize,
    /// Also broadcast an unaddressed offer whenever the relay opens.
    pub announce_offer: bool,
    pub ice_servers: Vec<String>,
    pub channel_label: String,
}

impl NodeConfig {
    pub fn new(relay_address: impl Into<String>) -> Self {
        Self {
            relay_address: relay_address.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `TIDEPOOL_*` environment variables.
    pub fn from_env(relay_address: impl Into<String>) -> Self {
        let mut config = Self::new(relay_address);
        if let Some(secs) = env_parse::<u64>("TIDEPOOL_RECONNECT_DELAY_SECS") {
            config.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TIDEPOOL_NEGOTIATION_TIMEOUT_SECS") {
            config.negotiation_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TIDEPOOL_ACK_TIMEOUT_SECS") {
            config.ack_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse::<usize>("TIDEPOOL_BATCH_SIZE").filter(|size| *size > 0) {
            config.batch_size = size;
        }
        if let Ok(value) = env::var("TIDEPOOL_ANNOUNCE_OFFER") {
            config.announce_offer = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if env::var("TIDEPOOL_DISABLE_STUN").is_ok() {
            config.ice_servers.clear();
        } else if let Ok(servers) = env::var("TIDEPOOL_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|server| !server.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_announce_offer(mut self, announce: bool) -> Self {
        self.announce_offer = announce;
        self
    }

    /// Interval of the sweep that reaps stale negotiations.
    pub fn sweep_interval(&self) -> Duration {
        (self.negotiation_timeout / 4).max(Duration::from_secs(1))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            relay_address: format!("{DEFAULT_RELAY_BASE}/subnet/default"),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            announce_offer: false,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variables are process-wide.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test_timeout::timeout]
    fn defaults_match_reference_policy() {
        let config = NodeConfig::new("ws://relay/subnet/taproah");
        assert_eq!(config.reconnect_delay, Duration::from_secs(120));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.channel_label, "main-channel");
        assert!(!config.announce_offer);
        assert!(!config.ice_servers.is_empty());
    }

    #[test_timeout::timeout]
    fn env_overrides_apply() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("TIDEPOOL_RECONNECT_DELAY_SECS", "5");
            env::set_var("TIDEPOOL_BATCH_SIZE", "0");
            env::set_var("TIDEPOOL_DISABLE_STUN", "1");
            env::set_var("TIDEPOOL_ANNOUNCE_OFFER", "true");
        }
        let config = NodeConfig::from_env("ws://relay/subnet/x");
        unsafe {
            env::remove_var("TIDEPOOL_RECONNECT_DELAY_SECS");
            env::remove_var("TIDEPOOL_BATCH_SIZE");
            env::remove_var("TIDEPOOL_DISABLE_STUN");
            env::remove_var("TIDEPOOL_ANNOUNCE_OFFER");
        }
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.ice_servers.is_empty());
        assert!(config.announce_offer);
    }

    #[test_timeout::timeout]
    fn sweep_interval_has_floor() {
        let config = NodeConfig::default().with_negotiation_timeout(Duration::from_millis(100));
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }
}
