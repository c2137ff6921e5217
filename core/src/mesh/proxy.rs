//! Brokered introductions over open peer channels
//!
//! Once an endpoint has at least one connected peer it can grow without the
//! relay service: it asks a connected peer (the broker) for an introduction,
//! and the broker shuttles the offer, answer and candidates between the
//! requester and the peer it chose. All three parties record who brokered
//! what so later candidates find their way along the same path.
//!
//! The full exchange, R requesting through broker B toward chosen peer Y:
//! R sends `proxy-request` to B; B picks Y and sends it `proxy-create`;
//! Y offers via `proxy-offer` to B, which delivers `offer` to R; R answers
//! via `proxy-answer` to B, which delivers `answer` to Y. Candidates travel
//! as `proxy-candidate` frames along the same brokered path.

use super::protocol::MeshMessage;
use crate::node::{MeshNode, NodeError};
use crate::peer::{ConnectionRegistry, PeerError, PeerId, PeerLink};
use crate::transport::{IceCandidate, TransportError, MAIN_CHANNEL};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Mesh growth error types
#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Who was introduced to whom, keyed by the broker that did it.
///
/// Each brokered pair is stored symmetrically: `lookup(broker, a)` yields
/// `b` and `lookup(broker, b)` yields `a`.
#[derive(Debug, Default)]
pub struct ProxyRelationTable {
    relations: HashMap<PeerId, HashMap<PeerId, PeerId>>,
}

impl ProxyRelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `relay` brokered the pair `(a, b)`. Both directions are
    /// stored together.
    pub fn insert(&mut self, relay: &str, a: &str, b: &str) {
        if a == b {
            return;
        }
        let pairs = self.relations.entry(relay.to_string()).or_default();
        // Detach any previous counterparts first; an overwrite must not
        // leave a one-sided entry behind.
        if let Some(old) = pairs.remove(a) {
            pairs.remove(&old);
        }
        if let Some(old) = pairs.remove(b) {
            pairs.remove(&old);
        }
        pairs.insert(a.to_string(), b.to_string());
        pairs.insert(b.to_string(), a.to_string());
    }

    /// The counterpart `relay` introduced to `peer`, if any.
    pub fn lookup(&self, relay: &str, peer: &str) -> Option<&PeerId> {
        self.relations.get(relay).and_then(|pairs| pairs.get(peer))
    }

    /// Brokers through which `target` is reachable.
    pub fn relays_for(&self, target: &str) -> Vec<PeerId> {
        self.relations
            .iter()
            .filter(|(_, pairs)| pairs.contains_key(target))
            .map(|(relay, _)| relay.clone())
            .collect()
    }

    /// Drop everything involving a departed peer: its own brokering record
    /// and every pair it appears in under other brokers.
    pub fn prune_peer(&mut self, id: &str) {
        self.relations.remove(id);
        for pairs in self.relations.values_mut() {
            if let Some(counterpart) = pairs.remove(id) {
                pairs.remove(&counterpart);
            }
        }
        self.relations.retain(|_, pairs| !pairs.is_empty());
    }

    pub fn relay_count(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

/// Drives brokered introductions in all three roles: requester, broker and
/// chosen peer.
pub struct ProxyRelayCoordinator {
    relations: RwLock<ProxyRelationTable>,
}

impl ProxyRelayCoordinator {
    pub fn new() -> Self {
        Self {
            relations: RwLock::new(ProxyRelationTable::new()),
        }
    }

    pub fn record(&self, relay: &str, a: &str, b: &str) {
        self.relations.write().insert(relay, a, b);
    }

    pub fn lookup(&self, relay: &str, peer: &str) -> Option<PeerId> {
        self.relations.read().lookup(relay, peer).cloned()
    }

    pub fn remove_peer(&self, id: &str) {
        self.relations.write().prune_peer(id);
    }

    pub fn relay_count(&self) -> usize {
        self.relations.read().relay_count()
    }

    /// Pick a peer to introduce to `requester`: any usable link that is not
    /// the requester itself and not in its exclusion list.
    pub fn select_introduction(
        &self,
        registry: &ConnectionRegistry,
        requester: &str,
        excluded: &[PeerId],
    ) -> Option<PeerId> {
        registry
            .connected_ids()
            .into_iter()
            .find(|id| id != requester && !excluded.iter().any(|e| e == id))
    }

    /// Find a broker link with an open `main` channel that can reach `to`.
    pub fn route_candidate(
        &self,
        registry: &ConnectionRegistry,
        to: &str,
    ) -> Option<Arc<PeerLink>> {
        self.relations
            .read()
            .relays_for(to)
            .into_iter()
            .filter_map(|relay| registry.get(&relay))
            .find(|link| link.has_open_channel(MAIN_CHANNEL))
    }

    /// Hand a locally gathered candidate for `target` to its broker.
    pub async fn relay_local_candidate(
        &self,
        registry: &ConnectionRegistry,
        target: &str,
        candidate: IceCandidate,
    ) -> Result<(), MeshError> {
        match self.route_candidate(registry, target) {
            Some(broker) => {
                send_main(
                    &broker,
                    &MeshMessage::ProxyCandidate {
                        to: target.to_string(),
                        candidate,
                    },
                )
                .await
            }
            None => {
                warn!(target = %target, "No broker route for candidate, dropping");
                Ok(())
            }
        }
    }

    /// Process one frame that arrived on `from`'s `main` channel.
    pub async fn handle_main_message(
        &self,
        node: &Arc<MeshNode>,
        from: &Arc<PeerLink>,
        msg: MeshMessage,
    ) -> Result<(), MeshError> {
        debug!(from = %from.id(), kind = msg.kind(), "Mesh frame");
        match msg {
            MeshMessage::ProxyRequest { connected_peers } => {
                self.handle_proxy_request(node, from, &connected_peers).await
            }
            MeshMessage::ProxyCreate { requester } => {
                self.handle_proxy_create(node, from, &requester).await
            }
            MeshMessage::Offer { from: offerer, offer } => {
                self.handle_relayed_offer(node, from, &offerer, offer).await
            }
            MeshMessage::Answer {
                from: answerer,
                answer,
            } => {
                match node.registry().get(&answerer) {
                    Some(link) => {
                        link.set_remote_description(answer).await?;
                        node.flush_pending(&link).await;
                    }
                    None => {
                        warn!(peer = %answerer, "Answer for unknown peer, dropping");
                    }
                }
                Ok(())
            }
            MeshMessage::ProxyOffer { to, offer } => {
                self.forward(
                    node,
                    &to,
                    MeshMessage::Offer {
                        from: from.id().to_string(),
                        offer,
                    },
                )
                .await
            }
            MeshMessage::ProxyAnswer { to, answer } => {
                self.forward(
                    node,
                    &to,
                    MeshMessage::Answer {
                        from: from.id().to_string(),
                        answer,
                    },
                )
                .await
            }
            MeshMessage::ProxyCandidate { to, candidate } => {
                self.forward(
                    node,
                    &to,
                    MeshMessage::Candidate {
                        from: from.id().to_string(),
                        candidate,
                    },
                )
                .await
            }
            MeshMessage::Candidate {
                from: sender,
                candidate,
            } => {
                node.apply_candidate(&sender, candidate).await;
                Ok(())
            }
            MeshMessage::NoPeersAvailable => {
                debug!(via = %from.id(), "Broker had no peers to introduce");
                node.events().emit(&crate::events::MeshEvent::NoPeersAvailable {
                    via: from.id().to_string(),
                });
                Ok(())
            }
        }
    }

    /// Broker role, step one: pick someone for the requester, remember the
    /// pair, and tell the chosen peer to start offering.
    async fn handle_proxy_request(
        &self,
        node: &Arc<MeshNode>,
        requester: &Arc<PeerLink>,
        excluded: &[PeerId],
    ) -> Result<(), MeshError> {
        let chosen = self.select_introduction(node.registry(), requester.id(), excluded);
        let Some(chosen) = chosen else {
            debug!(requester = %requester.id(), "No introduction available");
            return send_main(requester, &MeshMessage::NoPeersAvailable).await;
        };
        let Some(chosen_link) = node.registry().get(&chosen) else {
            return send_main(requester, &MeshMessage::NoPeersAvailable).await;
        };

        let self_id = node.local_id().unwrap_or_else(|| "local".to_string());
        self.record(&self_id, requester.id(), &chosen);
        debug!(requester = %requester.id(), chosen = %chosen, "Brokering introduction");

        send_main(
            &chosen_link,
            &MeshMessage::ProxyCreate {
                requester: requester.id().to_string(),
            },
        )
        .await
    }

    /// Chosen-peer role: open a brokered link toward the requester and send
    /// the offer back through the broker.
    async fn handle_proxy_create(
        &self,
        node: &Arc<MeshNode>,
        broker: &Arc<PeerLink>,
        requester: &str,
    ) -> Result<(), MeshError> {
        if node.registry().contains(requester) {
            debug!(peer = %requester, "Already linked, ignoring proxy-create");
            return Ok(());
        }
        let self_id = node.local_id().unwrap_or_else(|| "local".to_string());
        let link = node.create_proxy_peer(requester, true).await?;
        self.record(broker.id(), &self_id, requester);

        let offer = link.create_offer().await?;
        send_main(
            broker,
            &MeshMessage::ProxyOffer {
                to: requester.to_string(),
                offer,
            },
        )
        .await
    }

    /// Requester role: a brokered offer arrived, answer it back through the
    /// broker.
    async fn handle_relayed_offer(
        &self,
        node: &Arc<MeshNode>,
        broker: &Arc<PeerLink>,
        offerer: &str,
        offer: crate::transport::SessionDescription,
    ) -> Result<(), MeshError> {
        if node.registry().contains(offerer) {
            debug!(peer = %offerer, "Already linked, ignoring relayed offer");
            return Ok(());
        }
        let self_id = node.local_id().unwrap_or_else(|| "local".to_string());
        let link = node.create_proxy_peer(offerer, false).await?;
        self.record(broker.id(), &self_id, offerer);

        link.set_remote_description(offer).await?;
        node.flush_pending(&link).await;
        let answer = link.create_answer().await?;
        send_main(
            broker,
            &MeshMessage::ProxyAnswer {
                to: offerer.to_string(),
                answer,
            },
        )
        .await
    }

    /// Broker role: pass a relayed frame on to its target, or drop it when
    /// the target is gone.
    async fn forward(
        &self,
        node: &Arc<MeshNode>,
        to: &str,
        msg: MeshMessage,
    ) -> Result<(), MeshError> {
        match node.registry().get(to) {
            Some(target) => send_main(&target, &msg).await,
            None => {
                warn!(to = %to, kind = msg.kind(), "Relay target gone, dropping frame");
                Ok(())
            }
        }
    }
}

impl Default for ProxyRelayCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a mesh frame onto a link's `main` channel.
pub async fn send_main(link: &Arc<PeerLink>, msg: &MeshMessage) -> Result<(), MeshError> {
    let bytes = msg.to_bytes()?;
    link.send_on(MAIN_CHANNEL, bytes).await?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
