//! PeerLink — one remote endpoint's transport session and its state machine
//!
//! `Negotiating → Connected → Closed`, driven by the engine's independent
//! ICE-state and connection-state signals. Cleanup is one-shot; the
//! connected announcement is one-shot; channel registration is idempotent.

use super::PeerId;
use crate::transport::{
    IceCandidate, SessionDescription, SessionEvent, TransportError, TransportSession,
    CHAT_CHANNEL, MAIN_CHANNEL,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Session created, offer/answer exchange in progress.
    Negotiating,
    /// Transport session established.
    Connected,
    /// Torn down; terminal.
    Closed,
}

impl LinkState {
    /// Legal transitions. Everything else is rejected.
    pub fn can_transition(self, next: LinkState) -> bool {
        matches!(
            (self, next),
            (LinkState::Negotiating, LinkState::Connected)
                | (LinkState::Negotiating, LinkState::Closed)
                | (LinkState::Connected, LinkState::Closed)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Negotiating => write!(f, "negotiating"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// Readiness of one data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelReadyState {
    Open,
    Closed,
}

/// Handle to one data channel on a peer link. The underlying channel is
/// owned by the transport session; the handle carries the label and the
/// last observed ready state.
#[derive(Clone)]
pub struct ChannelHandle {
    pub label: String,
    session: Arc<dyn TransportSession>,
    ready_state: ChannelReadyState,
}

impl ChannelHandle {
    pub fn is_open(&self) -> bool {
        self.ready_state == ChannelReadyState::Open
    }

    pub fn ready_state(&self) -> ChannelReadyState {
        self.ready_state
    }

    /// Send raw data on this channel.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.session.send(&self.label, data).await
    }
}

/// Peer link error types
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Illegal state transition: {from} -> {to}")]
    IllegalTransition { from: LinkState, to: LinkState },
    #[error("Channel \"{0}\" is not open on this link")]
    ChannelNotOpen(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One remote endpoint's transport session, registered in the
/// `ConnectionRegistry` under the peer's id.
pub struct PeerLink {
    id: PeerId,
    session: Arc<dyn TransportSession>,
    state: RwLock<LinkState>,
    channels: RwLock<HashMap<String, ChannelHandle>>,
    /// Set when this link was introduced by a broker peer; its candidates
    /// are routed through that broker instead of the relay service.
    is_proxy: AtomicBool,
    proxy_target: RwLock<Option<PeerId>>,
    remote_description_set: AtomicBool,
    cleaned_up: AtomicBool,
    connected_announced: AtomicBool,
}

impl PeerLink {
    pub fn new(id: PeerId, session: Arc<dyn TransportSession>) -> Arc<Self> {
        Arc::new(Self {
            id,
            session,
            state: RwLock::new(LinkState::Negotiating),
            channels: RwLock::new(HashMap::new()),
            is_proxy: AtomicBool::new(false),
            proxy_target: RwLock::new(None),
            remote_description_set: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            connected_announced: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// Apply a state transition, rejecting illegal ones.
    pub fn transition(&self, next: LinkState) -> Result<(), PeerError> {
        let mut state = self.state.write();
        if !state.can_transition(next) {
            return Err(PeerError::IllegalTransition { from: *state, to: next });
        }
        debug!(peer = %self.id, from = %*state, to = %next, "peer link transition");
        *state = next;
        Ok(())
    }

    /// Flag this link as a brokered connection toward `target`.
    pub fn mark_proxy(&self, target: PeerId) {
        self.is_proxy.store(true, Ordering::SeqCst);
        *self.proxy_target.write() = Some(target);
    }

    pub fn is_proxy(&self) -> bool {
        self.is_proxy.load(Ordering::SeqCst)
    }

    pub fn proxy_target(&self) -> Option<PeerId> {
        self.proxy_target.read().clone()
    }

    /// Open the channels an offerer announces: `chat` then `main`.
    pub async fn open_outbound_channels(&self) -> Result<(), TransportError> {
        self.session.create_channel(CHAT_CHANNEL).await?;
        self.session.create_channel(MAIN_CHANNEL).await
    }

    /// Record a channel as open. Idempotent: a duplicate open event for a
    /// label leaves the existing handle untouched.
    pub fn register_channel(&self, label: &str) -> bool {
        let mut channels = self.channels.write();
        if let Some(handle) = channels.get_mut(label) {
            if handle.ready_state == ChannelReadyState::Closed {
                handle.ready_state = ChannelReadyState::Open;
                return true;
            }
            return false;
        }
        channels.insert(
            label.to_string(),
            ChannelHandle {
                label: label.to_string(),
                session: Arc::clone(&self.session),
                ready_state: ChannelReadyState::Open,
            },
        );
        true
    }

    /// Record a channel as closed, keeping the handle for inspection.
    pub fn channel_closed(&self, label: &str) {
        if let Some(handle) = self.channels.write().get_mut(label) {
            handle.ready_state = ChannelReadyState::Closed;
        }
    }

    pub fn channel(&self, label: &str) -> Option<ChannelHandle> {
        self.channels.read().get(label).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn has_open_channel(&self, label: &str) -> bool {
        self.channels
            .read()
            .get(label)
            .map(|handle| handle.is_open())
            .unwrap_or(false)
    }

    /// Send raw data on an open channel.
    pub async fn send_on(&self, label: &str, data: Vec<u8>) -> Result<(), PeerError> {
        let handle = self
            .channel(label)
            .filter(|handle| handle.is_open())
            .ok_or_else(|| PeerError::ChannelNotOpen(label.to_string()))?;
        handle.send(data).await.map_err(PeerError::from)
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.session.create_offer().await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.session.create_answer().await
    }

    /// Apply the remote description. Queued candidates must be flushed by
    /// the caller immediately afterwards, exactly once.
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.session.set_remote_description(description).await?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn remote_description_is_set(&self) -> bool {
        self.remote_description_set.load(Ordering::SeqCst)
    }

    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.session.add_remote_candidate(candidate).await
    }

    /// Take the session's event stream. Yields `Some` exactly once.
    pub fn take_session_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.session.events()
    }

    /// One-shot cleanup guard: true exactly once, for the caller that owns
    /// the teardown.
    pub fn begin_cleanup(&self) -> bool {
        !self.cleaned_up.swap(true, Ordering::SeqCst)
    }

    /// One-shot connected announcement: transitions to `Connected` and
    /// returns true exactly once.
    pub fn announce_connected(&self) -> bool {
        if self.connected_announced.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.transition(LinkState::Connected).is_ok()
    }

    pub async fn close_session(&self) {
        self.session.close().await;
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("is_proxy", &self.is_proxy())
            .field("proxy_target", &self.proxy_target())
            .field("channels", &self.channel_count())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
