use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

/// Schedules at most one relay reconnection at a time after a fixed delay.
///
/// Each schedule gets a generation number; a timer whose generation is no
/// longer current fires into the void.
#[derive(Debug)]
pub struct ReconnectPolicy {
    delay: Duration,
    generation: u64,
    scheduled: Option<u64>,
    timers: mpsc::UnboundedSender<u64>,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, timers: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            delay,
            generation: 0,
            scheduled: None,
            timers,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.is_some()
    }

    /// Arms the timer unless one is already pending. Returns whether it armed.
    pub fn schedule(&mut self) -> bool {
        if self.scheduled.is_some() {
            return false;
        }
        self.generation += 1;
        let generation = self.generation;
        self.scheduled = Some(generation);
        let delay = self.delay;
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(generation);
        });
        info!(target = "relay", delay_secs = delay.as_secs(), "relay reconnect scheduled");
        true
    }

    /// Consumes a timer firing. True when it is the pending attempt.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.scheduled == Some(generation) {
            self.scheduled = None;
            true
        } else {
            debug!(target = "relay", generation, "stale reconnect timer ignored");
            false
        }
    }

    pub fn cancel(&mut self) {
        if self.scheduled.take().is_some() {
            debug!(target = "relay", "pending reconnect cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(paused)]
    async fn fires_once_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut policy = ReconnectPolicy::new(Duration::from_secs(120), tx);
        assert!(policy.schedule());
        assert!(!policy.schedule());
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(rx.try_recv().is_err());
        let generation = rx.recv().await.unwrap();
        assert!(policy.fire(generation));
        assert!(!policy.is_scheduled());
        assert!(!policy.fire(generation));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn cancelled_timer_is_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut policy = ReconnectPolicy::new(Duration::from_secs(5), tx);
        policy.schedule();
        policy.cancel();
        assert!(policy.schedule());

        let mut fired = 0;
        for _ in 0..2 {
            let generation = rx.recv().await.unwrap();
            if policy.fire(generation) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }
}
