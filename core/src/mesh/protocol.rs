//! Mesh-growth control protocol
//!
//! These frames travel over already-open `main` channels between peers.
//! A requester asks a connected peer (the broker) for an introduction; the
//! broker relays the whole negotiation between the requester and the chosen
//! third peer without ever touching the relay service.

use crate::peer::PeerId;
use crate::transport::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

/// A frame on a peer's `main` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum MeshMessage {
    /// Requester asks the broker for one new peer, listing the peers it
    /// already has so the broker can exclude them.
    ProxyRequest { connected_peers: Vec<PeerId> },
    /// Broker tells the chosen peer to start an offer toward `requester`.
    ProxyCreate { requester: PeerId },
    /// Chosen peer hands its offer to the broker for relaying to `to`.
    ProxyOffer {
        to: PeerId,
        offer: SessionDescription,
    },
    /// Broker delivers a relayed offer, stamped with the offerer's id.
    Offer {
        from: PeerId,
        offer: SessionDescription,
    },
    /// Requester hands its answer to the broker for relaying to `to`.
    ProxyAnswer {
        to: PeerId,
        answer: SessionDescription,
    },
    /// Broker delivers a relayed answer, stamped with the answerer's id.
    Answer {
        from: PeerId,
        answer: SessionDescription,
    },
    /// Network candidate for a brokered negotiation, addressed to `to`.
    ProxyCandidate {
        to: PeerId,
        candidate: IceCandidate,
    },
    /// Broker delivers a relayed candidate, stamped with the sender's id.
    Candidate {
        from: PeerId,
        candidate: IceCandidate,
    },
    /// Broker has no peer to introduce beyond the requester's exclusions.
    NoPeersAvailable,
}

impl MeshMessage {
    /// Wire tag of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshMessage::ProxyRequest { .. } => "proxy-request",
            MeshMessage::ProxyCreate { .. } => "proxy-create",
            MeshMessage::ProxyOffer { .. } => "proxy-offer",
            MeshMessage::Offer { .. } => "offer",
            MeshMessage::ProxyAnswer { .. } => "proxy-answer",
            MeshMessage::Answer { .. } => "answer",
            MeshMessage::ProxyCandidate { .. } => "proxy-candidate",
            MeshMessage::Candidate { .. } => "candidate",
            MeshMessage::NoPeersAvailable => "no-peers-available",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kebab_case_tags() {
        let frames = [
            (
                MeshMessage::ProxyRequest {
                    connected_peers: vec![],
                },
                "proxy-request",
            ),
            (
                MeshMessage::ProxyCreate {
                    requester: "r".to_string(),
                },
                "proxy-create",
            ),
            (
                MeshMessage::ProxyOffer {
                    to: "t".to_string(),
                    offer: SessionDescription::offer("v=0"),
                },
                "proxy-offer",
            ),
            (
                MeshMessage::ProxyAnswer {
                    to: "t".to_string(),
                    answer: SessionDescription::answer("v=0"),
                },
                "proxy-answer",
            ),
            (
                MeshMessage::ProxyCandidate {
                    to: "t".to_string(),
                    candidate: IceCandidate::new("candidate:1"),
                },
                "proxy-candidate",
            ),
            (MeshMessage::NoPeersAvailable, "no-peers-available"),
        ];
        for (frame, tag) in frames {
            let json = serde_json::to_value(&frame).unwrap();
            assert_eq!(json["type"], tag);
            assert_eq!(frame.kind(), tag);
        }
    }

    #[test]
    fn test_proxy_request_lists_connected_peers_camel_case() {
        let msg = MeshMessage::ProxyRequest {
            connected_peers: vec!["a".to_string(), "b".to_string()],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["connectedPeers"][0], "a");
        assert_eq!(json["connectedPeers"][1], "b");
    }

    #[test]
    fn test_byte_roundtrip() {
        let msg = MeshMessage::Offer {
            from: "x".to_string(),
            offer: SessionDescription::offer("v=0"),
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(MeshMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_malformed_frame_is_rejected() {
        assert!(MeshMessage::from_bytes(b"{\"type\":\"teleport\"}").is_err());
        assert!(MeshMessage::from_bytes(b"not json").is_err());
    }
}
