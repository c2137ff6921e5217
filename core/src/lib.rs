//! meshweave-core: relay-bootstrapped peer meshes that grow peer-to-peer
//!
//! A fresh endpoint connects to a relay service and gets introduced to at
//! most one existing peer. Every further connection is brokered by peers the
//! endpoint already has, over their open `main` data channels, so the relay
//! stays a bootstrap-only dependency. The transport engine behind each peer
//! link is pluggable; an in-memory engine ships for tests.

pub mod config;
pub mod events;
pub mod mesh;
pub mod node;
pub mod peer;
pub mod signaling;
pub mod transport;

pub use config::MeshConfig;
pub use events::{EventHub, MeshEvent, Subscription};
pub use mesh::{MeshError, MeshGrowthScheduler, MeshMessage, ProxyRelayCoordinator};
pub use node::{node_with_endpoints, MeshNode, NodeError};
pub use peer::{ConnectionRegistry, LinkState, PeerId, PeerLink};
pub use signaling::{RelayServer, SignalMessage, SignalingConfig, SignalingLink, SignalingState};
pub use transport::{
    IceCandidate, IceServer, SessionDescription, TransportEngine, TransportError,
    TransportSession, CHAT_CHANNEL, MAIN_CHANNEL,
};
