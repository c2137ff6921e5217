//! Relay wire protocol
//!
//! Every frame is a JSON object tagged by a kebab-case `type` field with
//! camelCase payload keys. The relay service understands `connect`, `offer`,
//! `answer`, `candidate`, `ping` and `broadcast`; it originates `connected`,
//! `pong`, `peer-disconnected` and `error`.

use crate::peer::PeerId;
use crate::transport::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

/// A frame on the relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Greeting sent by the relay once per connection. Carries the assigned
    /// endpoint id, the id of one other connected endpoint when any exists,
    /// and the total count of connected endpoints.
    Connected {
        id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        available_connection: Option<PeerId>,
        connected_peers: usize,
    },
    /// Client asks the relay to deliver its offer to `to`.
    Connect {
        to: PeerId,
        offer: SessionDescription,
    },
    /// Offer delivered to its target, stamped with the sender's id.
    Offer {
        offer: SessionDescription,
        from: PeerId,
        to: PeerId,
    },
    /// Answer travelling back to the offerer.
    Answer {
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        to: PeerId,
    },
    /// Network candidate for an in-flight negotiation.
    Candidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        to: PeerId,
    },
    /// Liveness probe. `timestamp` is echoed back verbatim.
    Ping { timestamp: u64 },
    /// Reply to a ping. `server_tick` counts pings the relay has handled.
    Pong {
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_tick: Option<u64>,
    },
    /// Fan-out to every other connected endpoint.
    Broadcast {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
    },
    /// An endpoint's relay connection closed.
    PeerDisconnected { peer_id: PeerId },
    /// The relay could not act on a frame.
    Error { message: String },
}

impl SignalMessage {
    /// Wire tag of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Connected { .. } => "connected",
            SignalMessage::Connect { .. } => "connect",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Ping { .. } => "ping",
            SignalMessage::Pong { .. } => "pong",
            SignalMessage::Broadcast { .. } => "broadcast",
            SignalMessage::PeerDisconnected { .. } => "peer-disconnected",
            SignalMessage::Error { .. } => "error",
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
    fn test_connected_greeting_shape() {
        let msg = SignalMessage::Connected {
            id: "abc".to_string(),
            available_connection: Some("def".to_string()),
            connected_peers: 2,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["availableConnection"], "def");
        assert_eq!(json["connectedPeers"], 2);
    }

    #[test]
    fn test_connected_omits_absent_available_connection() {
        let msg = SignalMessage::Connected {
            id: "abc".to_string(),
            available_connection: None,
            connected_peers: 1,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("availableConnection").is_none());
    }

    #[test]
    fn test_peer_disconnected_tag_and_field() {
        let msg = SignalMessage::PeerDisconnected {
            peer_id: "abc".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "peer-disconnected");
        assert_eq!(json["peerId"], "abc");
    }

    #[test]
    fn test_connect_roundtrip() {
        let msg = SignalMessage::Connect {
            to: "target".to_string(),
            offer: SessionDescription::offer("v=0"),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: SignalMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.kind(), "connect");
    }

    #[test]
    fn test_candidate_nests_engine_fields() {
        let msg = SignalMessage::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
            from: Some("a".to_string()),
            to: "b".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["candidate"]["sdpMid"], "0");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_pong_with_tick() {
        let text = r#"{"type":"pong","timestamp":17,"serverTick":3}"#;
        let msg: SignalMessage = serde_json::from_str(text).unwrap();
        assert_eq!(
            msg,
            SignalMessage::Pong {
                timestamp: 17,
                server_tick: Some(3),
            }
        );
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let text = r#"{"type":"warp-drive"}"#;
        assert!(serde_json::from_str::<SignalMessage>(text).is_err());
    }
}
