//! Peer links and the connection registry

pub mod link;
pub mod registry;

pub use link::{ChannelHandle, ChannelReadyState, LinkState, PeerError, PeerLink};
pub use registry::{ConnectionRegistry, PendingCandidates, RegistryError};

/// Opaque endpoint identifier, unique for the lifetime of its connection.
/// Issued by the relay service (UUIDv4 strings in practice).
pub type PeerId = String;
