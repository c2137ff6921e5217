//! ConnectionRegistry — all active peer links, keyed by peer id
//!
//! The registry is the single owner of registered links: at most one
//! `PeerLink` per id at any time. `PendingCandidates` holds remote
//! candidates that arrived before a link's remote description was applied;
//! a queue is flushed exactly once, in arrival order.

use super::link::{LinkState, PeerLink};
use super::PeerId;
use crate::transport::IceCandidate;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Registry error types
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Peer {0} is already registered")]
    DuplicatePeer(PeerId),
}

/// Owns every active [`PeerLink`], keyed by peer id.
pub struct ConnectionRegistry {
    links: RwLock<HashMap<PeerId, Arc<PeerLink>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
        }
    }

    /// Register a link. Fails if the id is already present; the existing
    /// link stays untouched.
    pub fn insert(&self, link: Arc<PeerLink>) -> Result<(), RegistryError> {
        let mut links = self.links.write();
        if links.contains_key(link.id()) {
            return Err(RegistryError::DuplicatePeer(link.id().to_string()));
        }
        links.insert(link.id().to_string(), link);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<PeerLink>> {
        self.links.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.links.read().contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<PeerLink>> {
        self.links.write().remove(id)
    }

    /// All registered ids, in no particular order.
    pub fn ids(&self) -> Vec<PeerId> {
        self.links.read().keys().cloned().collect()
    }

    /// Snapshot of all registered links.
    pub fn snapshot(&self) -> Vec<Arc<PeerLink>> {
        self.links.read().values().cloned().collect()
    }

    /// Ids of links in `Connected` state with an open `main` channel —
    /// the peers usable as brokers.
    pub fn connected_ids(&self) -> Vec<PeerId> {
        self.links
            .read()
            .values()
            .filter(|link| {
                link.state() == LinkState::Connected
                    && link.has_open_channel(crate::transport::MAIN_CHANNEL)
            })
            .map(|link| link.id().to_string())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connected_ids().len()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Remote candidates held until the peer's remote description is applied.
pub struct PendingCandidates {
    queues: RwLock<HashMap<PeerId, Vec<IceCandidate>>>,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Queue a candidate for `id`, preserving arrival order.
    pub fn push(&self, id: &str, candidate: IceCandidate) {
        self.queues
            .write()
            .entry(id.to_string())
            .or_default()
            .push(candidate);
    }

    /// Remove and return the queue for `id` in arrival order. A second call
    /// returns nothing: the flush happens exactly once.
    pub fn take(&self, id: &str) -> Vec<IceCandidate> {
        self.queues.write().remove(id).unwrap_or_default()
    }

    /// Drop any queue for a departing peer.
    pub fn clear(&self, id: &str) {
        self.queues.write().remove(id);
    }

    pub fn queued_count(&self, id: &str) -> usize {
        self.queues.read().get(id).map(Vec::len).unwrap_or(0)
    }
}

impl Default for PendingCandidates {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryEngine, MemoryHub};
    use crate::transport::TransportEngine;

    async fn test_link(id: &str) -> Arc<PeerLink> {
        let engine = MemoryEngine::with_hub(MemoryHub::new());
        let session = engine.create_session("local", id, &[]).await.unwrap();
        PeerLink::new(id.to_string(), session)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let registry = ConnectionRegistry::new();
        let link = test_link("p1").await;

        registry.insert(Arc::clone(&link)).unwrap();
        assert!(registry.contains("p1"));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("p1").unwrap(), &link));
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let registry = ConnectionRegistry::new();
        let first = test_link("p1").await;
        let second = test_link("p1").await;

        registry.insert(Arc::clone(&first)).unwrap();
        let result = registry.insert(second);
        assert!(matches!(result, Err(RegistryError::DuplicatePeer(id)) if id == "p1"));

        // The first link is still the registered one.
        assert!(Arc::ptr_eq(&registry.get("p1").unwrap(), &first));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_uniqueness_across_connect_disconnect_sequences() {
        let registry = ConnectionRegistry::new();
        for _ in 0..5 {
            let link = test_link("p1").await;
            registry.insert(link).unwrap();
            assert_eq!(registry.len(), 1);
            registry.remove("p1").unwrap();
            assert!(registry.is_empty());
        }
    }

    #[tokio::test]
    async fn test_remove_missing_is_none() {
        let registry = ConnectionRegistry::new();
        assert!(registry.remove("ghost").is_none());
    }

    #[tokio::test]
    async fn test_connected_ids_requires_state_and_main_channel() {
        let registry = ConnectionRegistry::new();

        let negotiating = test_link("p1").await;
        registry.insert(negotiating).unwrap();

        let connected_no_main = test_link("p2").await;
        connected_no_main.announce_connected();
        registry.insert(connected_no_main).unwrap();

        let usable = test_link("p3").await;
        usable.announce_connected();
        usable.register_channel("main");
        registry.insert(usable).unwrap();

        assert_eq!(registry.connected_ids(), vec!["p3".to_string()]);
        assert_eq!(registry.connected_count(), 1);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_pending_candidates_ordering_and_single_flush() {
        let pending = PendingCandidates::new();
        for i in 0..4 {
            pending.push("p1", IceCandidate::new(format!("c{i}")));
        }
        assert_eq!(pending.queued_count("p1"), 4);

        let flushed = pending.take("p1");
        let order: Vec<&str> = flushed.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(order, vec!["c0", "c1", "c2", "c3"]);

        // Exactly once: nothing remains for a second flush.
        assert!(pending.take("p1").is_empty());
        assert_eq!(pending.queued_count("p1"), 0);
    }

    #[test]
    fn test_pending_candidates_per_peer_isolation() {
        let pending = PendingCandidates::new();
        pending.push("p1", IceCandidate::new("a"));
        pending.push("p2", IceCandidate::new("b"));

        assert_eq!(pending.take("p1").len(), 1);
        assert_eq!(pending.queued_count("p2"), 1);
    }

    #[test]
    fn test_pending_candidates_clear() {
        let pending = PendingCandidates::new();
        pending.push("p1", IceCandidate::new("a"));
        pending.clear("p1");
        assert!(pending.take("p1").is_empty());
    }
}
