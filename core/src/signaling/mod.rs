//! Relay signaling: wire protocol, client link and relay service

pub mod link;
pub mod protocol;
pub mod server;

pub use link::{SignalingConfig, SignalingError, SignalingLink, SignalingState};
pub use protocol::SignalMessage;
pub use server::RelayServer;
