//! Transport engine abstraction
//!
//! NAT traversal, session negotiation and encrypted channel transport are
//! external collaborators. The mesh core drives them through these traits:
//! it creates sessions and channels, generates offers/answers, applies remote
//! descriptions and candidates, and observes state transitions through the
//! session event stream. Everything else is the engine's business.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel carrying mesh-growth control traffic.
pub const MAIN_CHANNEL: &str = "main";
/// Channel carrying application chat traffic.
pub const CHAT_CHANNEL: &str = "chat";

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One side's negotiated session parameters, applied to the local session to
/// represent the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network candidate gathered by the engine during traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// ICE-level connectivity state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// Terminal values trigger link cleanup.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IceState::Disconnected | IceState::Failed | IceState::Closed
        )
    }
}

/// Overall session connection state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    /// Terminal values trigger link cleanup.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Disconnected | SessionState::Failed | SessionState::Closed
        )
    }
}

/// Events the engine raises on a session's event stream.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// ICE connectivity state changed.
    IceStateChanged(IceState),
    /// Overall connection state changed.
    StateChanged(SessionState),
    /// The engine gathered a local candidate to be sent to the remote side.
    LocalCandidate(IceCandidate),
    /// A data channel became usable.
    ChannelOpen { label: String },
    /// A data channel closed.
    ChannelClosed { label: String },
    /// Data arrived on a channel.
    ChannelMessage { label: String, data: Vec<u8> },
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::IceStateChanged(state) => write!(f, "IceStateChanged({state:?})"),
            SessionEvent::StateChanged(state) => write!(f, "StateChanged({state:?})"),
            SessionEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            SessionEvent::ChannelOpen { label } => write!(f, "ChannelOpen({label})"),
            SessionEvent::ChannelClosed { label } => write!(f, "ChannelClosed({label})"),
            SessionEvent::ChannelMessage { label, data } => {
                write!(f, "ChannelMessage({label}, {} bytes)", data.len())
            }
        }
    }
}

/// NAT-traversal server configuration passed through to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Transport engine error types
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Session creation failed: {0}")]
    SessionCreation(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Channel \"{0}\" is not open")]
    ChannelNotOpen(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Session is closed")]
    SessionClosed,
}

/// Factory for transport sessions toward remote endpoints.
#[async_trait]
pub trait TransportEngine: Send + Sync {
    /// Create a session from `local` toward `remote`.
    async fn create_session(
        &self,
        local: &str,
        remote: &str,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// One negotiated session with a remote endpoint.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Generate a local offer and store it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    /// Generate a local answer and store it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    /// Apply the remote side's description.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    /// Apply a remote network candidate.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    /// Open an outbound data channel with the given label.
    async fn create_channel(&self, label: &str) -> Result<(), TransportError>;
    /// Send data on an open channel.
    async fn send(&self, label: &str, data: Vec<u8>) -> Result<(), TransportError>;
    /// Take the session's event stream. Yields `Some` exactly once.
    fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>>;
    /// Tear the session down; the remote side observes a terminal state.
    async fn close(&self);
}

// ============================================================================
// TESTS
// ============================================================================
