//! Relay service
//!
//! Assigns an id to every websocket client, introduces one existing client
//! in the greeting, and forwards negotiation frames between clients by their
//! `to` field. The relay never inspects offers or candidates; it only stamps
//! the sender id on forwarded frames.

use super::protocol::SignalMessage;
use crate::peer::PeerId;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

type ClientMap = HashMap<PeerId, UnboundedSender<SignalMessage>>;

/// Websocket relay for endpoint introduction and negotiation forwarding.
pub struct RelayServer {
    clients: Arc<RwLock<ClientMap>>,
    server_tick: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            server_tick: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Bind to `addr` and serve until the returned task is aborted.
    pub async fn bind(&self, addr: &str) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Relay listening");

        let clients = Arc::clone(&self.clients);
        let tick = Arc::clone(&self.server_tick);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let clients = Arc::clone(&clients);
                        let tick = Arc::clone(&tick);
                        tokio::spawn(async move {
                            handle_connection(stream, peer_addr, clients, tick).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
        });
        Ok((local_addr, task))
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    clients: Arc<RwLock<ClientMap>>,
    tick: Arc<AtomicU64>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(addr = %peer_addr, error = %e, "Websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Register and pick the introduction under one lock so the greeting is
    // consistent with the membership it reports.
    let (available, count) = {
        let mut clients = clients.write();
        let available = pick_available(&clients, &id);
        clients.insert(id.clone(), tx.clone());
        (available, clients.len())
    };
    info!(id = %id, addr = %peer_addr, clients = count, "Client connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Frame serialization failed");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(SignalMessage::Connected {
        id: id.clone(),
        available_connection: available,
        connected_peers: count,
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                Ok(msg) => dispatch(&clients, &tick, &id, msg),
                Err(e) => {
                    debug!(id = %id, error = %e, "Dropping malformed frame");
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Departure: deregister, then tell everyone who is left.
    let remaining: Vec<UnboundedSender<SignalMessage>> = {
        let mut clients = clients.write();
        clients.remove(&id);
        clients.values().cloned().collect()
    };
    for peer in remaining {
        let _ = peer.send(SignalMessage::PeerDisconnected {
            peer_id: id.clone(),
        });
    }
    writer.abort();
    info!(id = %id, "Client disconnected");
}

/// Pick a random connected client other than `exclude`.
fn pick_available(clients: &ClientMap, exclude: &str) -> Option<PeerId> {
    let others: Vec<&PeerId> = clients.keys().filter(|id| *id != exclude).collect();
    others.choose(&mut rand::thread_rng()).map(|id| (*id).clone())
}

/// Route one inbound frame from client `from`.
fn dispatch(
    clients: &Arc<RwLock<ClientMap>>,
    tick: &Arc<AtomicU64>,
    from: &str,
    msg: SignalMessage,
) {
    let reply_to = |msg: SignalMessage| {
        if let Some(sender) = clients.read().get(from) {
            let _ = sender.send(msg);
        }
    };
    match msg {
        SignalMessage::Connect { to, offer } => {
            let target = clients.read().get(&to).cloned();
            match target {
                Some(target) => {
                    let _ = target.send(SignalMessage::Offer {
                        offer,
                        from: from.to_string(),
                        to,
                    });
                }
                None => {
                    reply_to(SignalMessage::Error {
                        message: format!("Peer {to} not found"),
                    });
                }
            }
        }
        SignalMessage::Answer { answer, to, .. } => {
            if let Some(target) = clients.read().get(&to).cloned() {
                let _ = target.send(SignalMessage::Answer {
                    answer,
                    from: Some(from.to_string()),
                    to,
                });
            } else {
                debug!(from = %from, to = %to, "Dropping answer for unknown peer");
            }
        }
        SignalMessage::Candidate { candidate, to, .. } => {
            if let Some(target) = clients.read().get(&to).cloned() {
                let _ = target.send(SignalMessage::Candidate {
                    candidate,
                    from: Some(from.to_string()),
                    to,
                });
            } else {
                debug!(from = %from, to = %to, "Dropping candidate for unknown peer");
            }
        }
        SignalMessage::Ping { timestamp } => {
            let current = tick.fetch_add(1, Ordering::SeqCst) + 1;
            reply_to(SignalMessage::Pong {
                timestamp,
                server_tick: Some(current),
            });
        }
        SignalMessage::Broadcast { message, .. } => {
            let others: Vec<UnboundedSender<SignalMessage>> = {
                let clients = clients.read();
                clients
                    .iter()
                    .filter(|(id, _)| id.as_str() != from)
                    .map(|(_, sender)| sender.clone())
                    .collect()
            };
            for peer in others {
                let _ = peer.send(SignalMessage::Broadcast {
                    message: message.clone(),
                    from: Some(from.to_string()),
                });
            }
        }
        other => {
            debug!(from = %from, kind = other.kind(), "Ignoring frame");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SessionDescription;

    fn map_with(ids: &[&str]) -> (Arc<RwLock<ClientMap>>, HashMap<PeerId, mpsc::UnboundedReceiver<SignalMessage>>) {
        let mut clients = HashMap::new();
        let mut receivers = HashMap::new();
        for id in ids {
            let (tx, rx) = mpsc::unbounded_channel();
            clients.insert(id.to_string(), tx);
            receivers.insert(id.to_string(), rx);
        }
        (Arc::new(RwLock::new(clients)), receivers)
    }

    #[test]
    fn test_pick_available_excludes_self() {
        let (clients, _rx) = map_with(&["a", "b"]);
        let clients = clients.read();
        assert_eq!(pick_available(&clients, "a"), Some("b".to_string()));
        assert_eq!(pick_available(&clients, "b"), Some("a".to_string()));
    }

    #[test]
    fn test_pick_available_empty() {
        let (clients, _rx) = map_with(&["a"]);
        let clients = clients.read();
        assert_eq!(pick_available(&clients, "a"), None);
    }

    #[test]
    fn test_connect_forwards_offer_with_sender_id() {
        let (clients, mut rx) = map_with(&["a", "b"]);
        let tick = Arc::new(AtomicU64::new(0));

        dispatch(
            &clients,
            &tick,
            "a",
            SignalMessage::Connect {
                to: "b".to_string(),
                offer: SessionDescription::offer("v=0"),
            },
        );

        let delivered = rx.get_mut("b").unwrap().try_recv().unwrap();
        assert_eq!(
            delivered,
            SignalMessage::Offer {
                offer: SessionDescription::offer("v=0"),
                from: "a".to_string(),
                to: "b".to_string(),
            }
        );
    }

    #[test]
    fn test_connect_to_unknown_peer_reports_error() {
        let (clients, mut rx) = map_with(&["a"]);
        let tick = Arc::new(AtomicU64::new(0));

        dispatch(
            &clients,
            &tick,
            "a",
            SignalMessage::Connect {
                to: "ghost".to_string(),
                offer: SessionDescription::offer("v=0"),
            },
        );

        let delivered = rx.get_mut("a").unwrap().try_recv().unwrap();
        assert!(matches!(
            delivered,
            SignalMessage::Error { message } if message.contains("ghost")
        ));
    }

    #[test]
    fn test_answer_stamped_with_sender() {
        let (clients, mut rx) = map_with(&["a", "b"]);
        let tick = Arc::new(AtomicU64::new(0));

        dispatch(
            &clients,
            &tick,
            "b",
            SignalMessage::Answer {
                answer: SessionDescription::answer("v=0"),
                from: None,
                to: "a".to_string(),
            },
        );

        let delivered = rx.get_mut("a").unwrap().try_recv().unwrap();
        assert!(matches!(
            delivered,
            SignalMessage::Answer { from: Some(from), .. } if from == "b"
        ));
    }

    #[test]
    fn test_ping_increments_tick() {
        let (clients, mut rx) = map_with(&["a"]);
        let tick = Arc::new(AtomicU64::new(0));

        dispatch(&clients, &tick, "a", SignalMessage::Ping { timestamp: 7 });
        dispatch(&clients, &tick, "a", SignalMessage::Ping { timestamp: 8 });

        let rx = rx.get_mut("a").unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            SignalMessage::Pong {
                timestamp: 7,
                server_tick: Some(1),
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SignalMessage::Pong {
                timestamp: 8,
                server_tick: Some(2),
            }
        );
    }

    #[test]
    fn test_broadcast_fans_out_to_everyone_else() {
        let (clients, mut rx) = map_with(&["a", "b", "c"]);
        let tick = Arc::new(AtomicU64::new(0));

        dispatch(
            &clients,
            &tick,
            "a",
            SignalMessage::Broadcast {
                message: "hello".to_string(),
                from: None,
            },
        );

        for id in ["b", "c"] {
            let delivered = rx.get_mut(id).unwrap().try_recv().unwrap();
            assert_eq!(
                delivered,
                SignalMessage::Broadcast {
                    message: "hello".to_string(),
                    from: Some("a".to_string()),
                }
            );
        }
        assert!(rx.get_mut("a").unwrap().try_recv().is_err());
    }
}
