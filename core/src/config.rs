//! Node configuration

use crate::signaling::SignalingConfig;
use crate::transport::IceServer;
use std::time::Duration;

/// Top-level configuration for a mesh endpoint.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Upper bound on simultaneous peer links.
    pub max_connections: usize,
    /// NAT-traversal servers handed to the transport engine.
    pub ice_servers: Vec<IceServer>,
    /// How often the node tries to grow the mesh by one peer.
    pub growth_interval: Duration,
    /// Send a greeting on the chat channel when it opens.
    pub send_greeting: bool,
    /// Relay connection settings.
    pub signaling: SignalingConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            growth_interval: Duration::from_secs(10),
            send_greeting: true,
            signaling: SignalingConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Default configuration pointed at the given relay endpoints.
    pub fn with_endpoints(endpoints: Vec<String>) -> Self {
        Self {
            signaling: SignalingConfig {
                endpoints,
                ..SignalingConfig::default()
            },
            ..Self::default()
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.growth_interval, Duration::from_secs(10));
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
    }

    #[test]
    fn test_with_endpoints() {
        let config = MeshConfig::with_endpoints(vec!["ws://relay:3000".to_string()]);
        assert_eq!(config.signaling.endpoints, vec!["ws://relay:3000"]);
        assert_eq!(config.max_connections, 5);
    }
}
