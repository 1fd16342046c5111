//! Subnet membership. A subnet is the set of sockets currently attached to
//! the same `/subnet/:name` path; a frame from one member goes to the rest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RelayConfig;

pub type MemberId = u64;

#[derive(Clone)]
pub struct RelayState {
    /// subnet name -> (member -> outbound queue)
    subnets: Arc<DashMap<String, DashMap<MemberId, mpsc::UnboundedSender<String>>>>,
    next_member: Arc<AtomicU64>,
    config: Arc<RelayConfig>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            subnets: Arc::new(DashMap::new()),
            next_member: Arc::new(AtomicU64::new(1)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn join(&self, subnet: &str) -> (MemberId, mpsc::UnboundedReceiver<String>) {
        let id = self.next_member.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subnets
            .entry(subnet.to_string())
            .or_default()
            .insert(id, tx);
        debug!(subnet, member = id, "member joined");
        (id, rx)
    }

    pub fn leave(&self, subnet: &str, member: MemberId) {
        if let Some(members) = self.subnets.get(subnet) {
            members.remove(&member);
        }
        self.subnets.remove_if(subnet, |_, members| members.is_empty());
        debug!(subnet, member, "member left");
    }

    /// Queues `text` for the other members of `subnet` (and the sender when
    /// echo is on). Returns how many members it was queued for.
    pub fn forward(&self, subnet: &str, from: MemberId, text: &str) -> usize {
        if text.len() > self.config.max_message_bytes {
            warn!(
                subnet,
                member = from,
                len = text.len(),
                limit = self.config.max_message_bytes,
                "oversized frame dropped"
            );
            return 0;
        }
        let Some(members) = self.subnets.get(subnet) else {
            return 0;
        };
        let mut delivered = 0;
        for member in members.iter() {
            if *member.key() == from && !self.config.echo {
                continue;
            }
            if member.value().send(text.to_string()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subnet_count(&self) -> usize {
        self.subnets.len()
    }

    pub fn member_count(&self) -> usize {
        self.subnets.iter().map(|members| members.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(echo: bool) -> RelayState {
        RelayState::new(RelayConfig {
            echo,
            max_message_bytes: 16,
            ..RelayConfig::default()
        })
    }

    #[test_timeout::timeout]
    fn frames_stay_inside_their_subnet() {
        let relay = state(false);
        let (a, mut a_rx) = relay.join("reef");
        let (_, mut b_rx) = relay.join("reef");
        let (_, mut other_rx) = relay.join("lagoon");

        assert_eq!(relay.forward("reef", a, "hi"), 1);
        assert_eq!(b_rx.try_recv().unwrap(), "hi");
        assert!(a_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn echo_includes_the_sender() {
        let relay = state(true);
        let (a, mut a_rx) = relay.join("reef");
        assert_eq!(relay.forward("reef", a, "hi"), 1);
        assert_eq!(a_rx.try_recv().unwrap(), "hi");
    }

    #[test_timeout::timeout]
    fn oversized_frames_are_dropped() {
        let relay = state(true);
        let (a, mut a_rx) = relay.join("reef");
        assert_eq!(relay.forward("reef", a, "this frame is far too long"), 0);
        assert!(a_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn empty_subnets_are_forgotten() {
        let relay = state(true);
        let (a, _a_rx) = relay.join("reef");
        let (b, _b_rx) = relay.join("reef");
        relay.leave("reef", a);
        assert_eq!((relay.subnet_count(), relay.member_count()), (1, 1));
        relay.leave("reef", b);
        assert_eq!(relay.subnet_count(), 0);
    }
}
