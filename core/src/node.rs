//! Mesh node orchestration
//!
//! `MeshNode` ties the pieces together: it holds the relay link, the peer
//! registry, the proxy coordinator and the growth scheduler, and it drives
//! every peer link from the events its transport session emits. The relay
//! brokers exactly one bootstrap connection per endpoint; all further links
//! are introduced peer-to-peer through open `main` channels.

use crate::config::MeshConfig;
use crate::events::{EventHub, MeshEvent};
use crate::mesh::{send_main, MeshGrowthScheduler, MeshMessage, ProxyRelayCoordinator};
use crate::peer::{
    ConnectionRegistry, LinkState, PeerError, PeerId, PeerLink, PendingCandidates, RegistryError,
};
use crate::signaling::{SignalMessage, SignalingError, SignalingLink};
use crate::transport::{
    IceCandidate, SessionEvent, TransportEngine, TransportError, CHAT_CHANNEL, MAIN_CHANNEL,
};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Node error types
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Peer {0} not found")]
    PeerNotFound(PeerId),
}

/// One mesh endpoint.
pub struct MeshNode {
    config: MeshConfig,
    engine: Arc<dyn TransportEngine>,
    registry: ConnectionRegistry,
    pending: PendingCandidates,
    coordinator: ProxyRelayCoordinator,
    signaling: Arc<SignalingLink>,
    events: EventHub<MeshEvent>,
    local_id: RwLock<Option<PeerId>>,
    inbound: AsyncMutex<Option<mpsc::UnboundedReceiver<SignalMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pumps: Mutex<HashMap<PeerId, JoinHandle<()>>>,
}

impl MeshNode {
    pub fn new(
        config: MeshConfig,
        engine: Arc<dyn TransportEngine>,
    ) -> Result<Arc<Self>, NodeError> {
        let (signaling, inbound) = SignalingLink::new(config.signaling.clone())?;
        Ok(Arc::new(Self {
            config,
            engine,
            registry: ConnectionRegistry::new(),
            pending: PendingCandidates::new(),
            coordinator: ProxyRelayCoordinator::new(),
            signaling,
            events: EventHub::new(),
            local_id: RwLock::new(None),
            inbound: AsyncMutex::new(Some(inbound)),
            tasks: Mutex::new(Vec::new()),
            pumps: Mutex::new(HashMap::new()),
        }))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventHub<MeshEvent> {
        &self.events
    }

    pub fn coordinator(&self) -> &ProxyRelayCoordinator {
        &self.coordinator
    }

    pub fn signaling(&self) -> &Arc<SignalingLink> {
        &self.signaling
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.local_id.read().clone()
    }

    pub fn set_local_id(&self, id: PeerId) {
        *self.local_id.write() = Some(id);
    }

    /// Connect to the relay, start dispatching its frames and start the
    /// growth scheduler. A failed first connect is retried in the
    /// background.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        if let Err(e) = self.signaling.connect().await {
            warn!(error = %e, "Initial relay connect failed, retrying in background");
        }

        if let Some(mut inbound) = self.inbound.lock().await.take() {
            let node = Arc::clone(self);
            let dispatch = tokio::spawn(async move {
                while let Some(msg) = inbound.recv().await {
                    node.handle_signal(msg).await;
                }
            });
            self.tasks.lock().push(dispatch);
        }

        let scheduler = MeshGrowthScheduler::new(self.config.growth_interval);
        self.tasks.lock().push(scheduler.spawn(Arc::clone(self)));
        Ok(())
    }

    /// Tear everything down: background tasks, peer links, relay link.
    pub async fn close(self: &Arc<Self>) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for link in self.registry.snapshot() {
            self.cleanup_link(&link).await;
        }
        for (_, pump) in self.pumps.lock().drain() {
            pump.abort();
        }
        self.signaling.close().await;
    }

    async fn handle_signal(self: &Arc<Self>, msg: SignalMessage) {
        debug!(kind = msg.kind(), "Relay frame");
        match msg {
            SignalMessage::Connected {
                id,
                available_connection,
                connected_peers,
            } => {
                info!(id = %id, peers = connected_peers, "Relay assigned endpoint id");
                self.set_local_id(id.clone());
                self.events.emit(&MeshEvent::SignalingConnected { id });
                if let Some(target) = available_connection {
                    if let Err(e) = self.initiate_connection(&target).await {
                        warn!(target = %target, error = %e, "Bootstrap connection failed");
                    }
                }
            }
            SignalMessage::Offer { offer, from, .. } => {
                if self.registry.contains(&from) {
                    debug!(peer = %from, "Already linked, ignoring relay offer");
                    return;
                }
                let result: Result<(), NodeError> = async {
                    let link = self.create_peer(&from, false).await?;
                    link.set_remote_description(offer).await?;
                    self.flush_pending(&link).await;
                    let answer = link.create_answer().await?;
                    self.signaling
                        .send(SignalMessage::Answer {
                            answer,
                            from: None,
                            to: from.clone(),
                        })
                        .await?;
                    Ok(())
                }
                .await;
                if let Err(e) = result {
                    warn!(peer = %from, error = %e, "Answering relay offer failed");
                }
            }
            SignalMessage::Answer { answer, from, .. } => {
                let Some(from) = from else {
                    warn!("Answer without sender id, dropping");
                    return;
                };
                match self.registry.get(&from) {
                    Some(link) => {
                        if let Err(e) = link.set_remote_description(answer).await {
                            warn!(peer = %from, error = %e, "Applying answer failed");
                            return;
                        }
                        self.flush_pending(&link).await;
                    }
                    None => warn!(peer = %from, "Answer for unknown peer, dropping"),
                }
            }
            SignalMessage::Candidate {
                candidate, from, ..
            } => {
                let Some(from) = from else {
                    warn!("Candidate without sender id, dropping");
                    return;
                };
                self.apply_candidate(&from, candidate).await;
            }
            SignalMessage::Pong {
                timestamp,
                server_tick,
            } => {
                let rtt = now_millis().saturating_sub(timestamp);
                debug!(rtt_ms = rtt, tick = ?server_tick, "Pong");
            }
            SignalMessage::Broadcast { message, from } => {
                self.events.emit(&MeshEvent::BroadcastReceived {
                    from: from.unwrap_or_default(),
                    message,
                });
            }
            SignalMessage::PeerDisconnected { peer_id } => {
                // Relay departure does not imply the direct link is dead.
                debug!(peer = %peer_id, "Peer left the relay");
            }
            SignalMessage::Error { message } => {
                warn!(message = %message, "Relay error");
            }
            other => {
                debug!(kind = other.kind(), "Ignoring relay frame");
            }
        }
    }

    /// Offer toward `target` through the relay. Used once per endpoint for
    /// the bootstrap connection.
    pub async fn initiate_connection(self: &Arc<Self>, target: &str) -> Result<(), NodeError> {
        if self.registry.contains(target) {
            return Ok(());
        }
        if self.registry.len() >= self.config.max_connections {
            debug!(target = %target, "At capacity, skipping connection");
            return Ok(());
        }
        let link = self.create_peer(target, true).await?;
        let offer = link.create_offer().await?;
        self.signaling
            .send(SignalMessage::Connect {
                to: target.to_string(),
                offer,
            })
            .await?;
        Ok(())
    }

    /// Create and register a relay-negotiated link. Returns the existing
    /// link when one is already registered.
    pub async fn create_peer(
        self: &Arc<Self>,
        id: &str,
        offerer: bool,
    ) -> Result<Arc<PeerLink>, NodeError> {
        self.create_peer_inner(id, offerer, false).await
    }

    /// Create and register a brokered link toward `id`; its candidates are
    /// routed through a broker instead of the relay service.
    pub async fn create_proxy_peer(
        self: &Arc<Self>,
        id: &str,
        offerer: bool,
    ) -> Result<Arc<PeerLink>, NodeError> {
        self.create_peer_inner(id, offerer, true).await
    }

    async fn create_peer_inner(
        self: &Arc<Self>,
        id: &str,
        offerer: bool,
        brokered: bool,
    ) -> Result<Arc<PeerLink>, NodeError> {
        if let Some(existing) = self.registry.get(id) {
            return Ok(existing);
        }
        let local = self.local_id().unwrap_or_else(|| "local".to_string());
        let session = self
            .engine
            .create_session(&local, id, &self.config.ice_servers)
            .await?;
        let link = PeerLink::new(id.to_string(), session);
        if brokered {
            link.mark_proxy(id.to_string());
        }
        if let Err(RegistryError::DuplicatePeer(_)) = self.registry.insert(Arc::clone(&link)) {
            // Lost a registration race; the winner's link is the real one.
            return Ok(self.registry.get(id).unwrap_or(link));
        }
        if offerer {
            link.open_outbound_channels().await?;
        }
        if let Some(mut events) = link.take_session_events() {
            let node = Arc::clone(self);
            let pumped = Arc::clone(&link);
            let pump = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    node.handle_session_event(&pumped, event).await;
                }
            });
            if let Some(previous) = self.pumps.lock().insert(id.to_string(), pump) {
                previous.abort();
            }
        }
        Ok(link)
    }

    // Boxed because handling a `main` frame can create another peer link,
    // whose event pump calls back into this function.
    fn handle_session_event<'a>(
        self: &'a Arc<Self>,
        link: &'a Arc<PeerLink>,
        event: SessionEvent,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.dispatch_session_event(link, event))
    }

    async fn dispatch_session_event(self: &Arc<Self>, link: &Arc<PeerLink>, event: SessionEvent) {
        match event {
            SessionEvent::LocalCandidate(candidate) => {
                if link.is_proxy() {
                    if let Err(e) = self
                        .coordinator
                        .relay_local_candidate(&self.registry, link.id(), candidate)
                        .await
                    {
                        warn!(peer = %link.id(), error = %e, "Brokered candidate relay failed");
                    }
                } else if let Err(e) = self
                    .signaling
                    .send(SignalMessage::Candidate {
                        candidate,
                        from: None,
                        to: link.id().to_string(),
                    })
                    .await
                {
                    warn!(peer = %link.id(), error = %e, "Candidate send failed");
                }
            }
            SessionEvent::IceStateChanged(state) if state.is_terminal() => {
                self.cleanup_link(link).await;
            }
            SessionEvent::StateChanged(state) if state.is_terminal() => {
                self.cleanup_link(link).await;
            }
            SessionEvent::StateChanged(state) => {
                if state == crate::transport::SessionState::Connected
                    && link.announce_connected()
                {
                    info!(peer = %link.id(), "Peer connected");
                    self.events.emit(&MeshEvent::NewConnection {
                        peer_id: link.id().to_string(),
                    });
                }
            }
            SessionEvent::IceStateChanged(state) => {
                debug!(peer = %link.id(), state = ?state, "ICE state");
            }
            SessionEvent::ChannelOpen { label } => {
                link.register_channel(&label);
                if label == CHAT_CHANNEL && self.config.send_greeting {
                    let greeting = format!(
                        "Hello from {}",
                        self.local_id().unwrap_or_else(|| "local".to_string())
                    );
                    if let Err(e) = link.send_on(CHAT_CHANNEL, greeting.into_bytes()).await {
                        debug!(peer = %link.id(), error = %e, "Greeting not delivered");
                    }
                }
            }
            SessionEvent::ChannelClosed { label } => {
                link.channel_closed(&label);
            }
            SessionEvent::ChannelMessage { label, data } => match label.as_str() {
                MAIN_CHANNEL => match MeshMessage::from_bytes(&data) {
                    Ok(msg) => {
                        if let Err(e) = self
                            .coordinator
                            .handle_main_message(self, link, msg)
                            .await
                        {
                            warn!(peer = %link.id(), error = %e, "Mesh frame handling failed");
                        }
                    }
                    Err(e) => {
                        warn!(peer = %link.id(), error = %e, "Dropping malformed mesh frame");
                    }
                },
                CHAT_CHANNEL => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    self.events.emit(&MeshEvent::ChatMessage {
                        peer_id: link.id().to_string(),
                        text,
                    });
                }
                other => {
                    debug!(peer = %link.id(), label = %other, "Data on unknown channel");
                }
            },
        }
    }

    /// Apply a remote candidate, or queue it until the peer's remote
    /// description is in place.
    pub async fn apply_candidate(&self, id: &str, candidate: IceCandidate) {
        match self.registry.get(id) {
            Some(link) if link.remote_description_is_set() => {
                if let Err(e) = link.add_remote_candidate(candidate).await {
                    warn!(peer = %id, error = %e, "Applying candidate failed");
                }
            }
            _ => {
                debug!(peer = %id, "Queueing early candidate");
                self.pending.push(id, candidate);
            }
        }
    }

    /// Drain the queued candidates for a link, in arrival order.
    pub async fn flush_pending(&self, link: &Arc<PeerLink>) {
        for candidate in self.pending.take(link.id()) {
            if let Err(e) = link.add_remote_candidate(candidate).await {
                warn!(peer = %link.id(), error = %e, "Flushing queued candidate failed");
            }
        }
    }

    /// Tear a link down once: registry, relation table and candidate queue
    /// all forget the peer, and the session is closed.
    pub async fn cleanup_link(self: &Arc<Self>, link: &Arc<PeerLink>) {
        if !link.begin_cleanup() {
            return;
        }
        info!(peer = %link.id(), "Cleaning up peer link");
        let _ = link.transition(LinkState::Closed);
        self.registry.remove(link.id());
        self.coordinator.remove_peer(link.id());
        self.pending.clear(link.id());
        link.close_session().await;
        self.events.emit(&MeshEvent::PeerRemoved {
            peer_id: link.id().to_string(),
        });
        // Last, with no await after: cleanup may be running on the pump
        // task itself, and aborting it cancels the next await point.
        if let Some(pump) = self.pumps.lock().remove(link.id()) {
            pump.abort();
        }
    }

    /// One growth attempt: with at least one usable peer and spare capacity,
    /// ask a random connected peer for an introduction.
    pub async fn request_introduction(self: &Arc<Self>) {
        let connected = self.registry.connected_ids();
        if !crate::mesh::should_request(connected.len(), self.config.max_connections) {
            return;
        }
        let Some(broker_id) = connected.choose(&mut rand::thread_rng()).cloned() else {
            return;
        };
        let Some(broker) = self.registry.get(&broker_id) else {
            return;
        };
        debug!(broker = %broker_id, peers = connected.len(), "Requesting introduction");
        if let Err(e) = send_main(
            &broker,
            &MeshMessage::ProxyRequest {
                connected_peers: connected,
            },
        )
        .await
        {
            warn!(broker = %broker_id, error = %e, "Introduction request failed");
        }
    }

    /// Send a chat line to one connected peer.
    pub async fn send_chat(&self, peer_id: &str, text: &str) -> Result<(), NodeError> {
        let link = self
            .registry
            .get(peer_id)
            .ok_or_else(|| NodeError::PeerNotFound(peer_id.to_string()))?;
        link.send_on(CHAT_CHANNEL, text.as_bytes().to_vec()).await?;
        Ok(())
    }

    /// Fan a message out to every other relay client.
    pub async fn broadcast(&self, message: &str) -> Result<(), NodeError> {
        self.signaling
            .send(SignalMessage::Broadcast {
                message: message.to_string(),
                from: None,
            })
            .await?;
        Ok(())
    }

    /// Probe relay liveness.
    pub async fn ping(&self) -> Result<(), NodeError> {
        self.signaling
            .send(SignalMessage::Ping {
                timestamp: now_millis(),
            })
            .await?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Convenience constructor used by binaries: default config pointed at the
/// given relay endpoints.
pub fn node_with_endpoints(
    endpoints: Vec<String>,
    engine: Arc<dyn TransportEngine>,
) -> Result<Arc<MeshNode>, NodeError> {
    MeshNode::new(MeshConfig::with_endpoints(endpoints), engine)
}

// ============================================================================
// TESTS
// ============================================================================
