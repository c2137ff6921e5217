//! Periodic mesh growth
//!
//! A fixed-interval timer asks the node to request one more introduction
//! whenever it has at least one usable peer and room for another. An
//! endpoint with zero peers cannot grow this way; it waits for the relay
//! bootstrap instead.

use crate::node::MeshNode;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Whether an endpoint with `connected` usable peers out of `max` should
/// ask for another introduction.
pub fn should_request(connected: usize, max: usize) -> bool {
    connected > 0 && connected < max
}

/// Ticks the growth attempt on a fixed interval.
pub struct MeshGrowthScheduler {
    interval: Duration,
}

impl MeshGrowthScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Spawn the growth loop. Runs until the returned task is aborted.
    pub fn spawn(&self, node: Arc<MeshNode>) -> JoinHandle<()> {
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; growth starts on the next.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("Growth tick");
                node.request_introduction().await;
            }
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_request_boundaries() {
        assert!(!should_request(0, 5));
        assert!(should_request(1, 5));
        assert!(should_request(4, 5));
        assert!(!should_request(5, 5));
        assert!(!should_request(6, 5));
    }

    #[test]
    fn test_should_request_zero_capacity() {
        assert!(!should_request(0, 0));
        assert!(!should_request(1, 0));
    }
}
