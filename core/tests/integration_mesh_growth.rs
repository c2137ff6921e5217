//! Mesh bootstrap and growth end-to-end
//!
//! Nodes share one in-memory transport hub, so their sessions pair the way
//! real engine sessions would once both descriptions are in place. The relay
//! service runs in-process over real websockets.

use meshweave_core::config::MeshConfig;
use meshweave_core::events::MeshEvent;
use meshweave_core::node::MeshNode;
use meshweave_core::signaling::SignalingConfig;
use meshweave_core::transport::memory::{MemoryEngine, MemoryHub};
use meshweave_core::transport::MAIN_CHANNEL;
use meshweave_core::RelayServer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_config(endpoints: Vec<String>) -> MeshConfig {
    MeshConfig {
        // Growth is driven manually in these tests.
        growth_interval: Duration::from_secs(3600),
        signaling: SignalingConfig {
            endpoints,
            send_timeout: Duration::from_millis(200),
            send_poll_interval: Duration::from_millis(20),
            ..SignalingConfig::default()
        },
        ..MeshConfig::default()
    }
}

fn node_on(hub: &Arc<MemoryHub>, endpoints: Vec<String>) -> Arc<MeshNode> {
    let engine = Arc::new(MemoryEngine::with_hub(Arc::clone(hub)));
    MeshNode::new(test_config(endpoints), engine).unwrap()
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Negotiate a relay-style direct link between two nodes with ids already
/// assigned, and wait for both sides to come up.
async fn connect_directly(x: &Arc<MeshNode>, y: &Arc<MeshNode>) {
    let x_id = x.local_id().unwrap();
    let y_id = y.local_id().unwrap();

    let link_x = x.create_peer(&y_id, true).await.unwrap();
    let offer = link_x.create_offer().await.unwrap();

    let link_y = y.create_peer(&x_id, false).await.unwrap();
    link_y.set_remote_description(offer).await.unwrap();
    let answer = link_y.create_answer().await.unwrap();
    link_x.set_remote_description(answer).await.unwrap();

    wait_until("direct link up on both sides", || {
        link_x.has_open_channel(MAIN_CHANNEL) && link_y.has_open_channel(MAIN_CHANNEL)
    })
    .await;
}

async fn start_relay() -> (String, tokio::task::JoinHandle<()>) {
    let relay = RelayServer::new();
    let (addr, task) = relay.bind("127.0.0.1:0").await.unwrap();
    (format!("ws://{addr}"), task)
}

#[tokio::test]
async fn bootstrap_pairs_first_two_nodes() {
    let (endpoint, server) = start_relay().await;
    let hub = MemoryHub::new();

    let a = node_on(&hub, vec![endpoint.clone()]);
    a.start().await.unwrap();
    wait_until("first node assigned an id", || a.local_id().is_some()).await;

    let chats = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&chats);
    let _sub = a.events().subscribe(move |event: &MeshEvent| {
        if matches!(event, MeshEvent::ChatMessage { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let b = node_on(&hub, vec![endpoint.clone()]);
    b.start().await.unwrap();

    wait_until("bootstrap pair connected", || {
        a.registry().connected_count() == 1 && b.registry().connected_count() == 1
    })
    .await;

    // The opening greeting travelled over the chat channel.
    wait_until("greeting delivered", || chats.load(Ordering::SeqCst) >= 1).await;

    a.close().await;
    b.close().await;
    server.abort();
}

#[tokio::test]
async fn three_nodes_grow_into_a_full_mesh() {
    let (endpoint, server) = start_relay().await;
    let hub = MemoryHub::new();

    let nodes = [
        node_on(&hub, vec![endpoint.clone()]),
        node_on(&hub, vec![endpoint.clone()]),
        node_on(&hub, vec![endpoint.clone()]),
    ];
    for node in &nodes {
        node.start().await.unwrap();
        // Sequential joins keep each greeting's introduction meaningful.
        wait_until("node assigned an id", || node.local_id().is_some()).await;
    }

    wait_until("every node bootstrapped one link", || {
        nodes.iter().all(|n| n.registry().connected_count() >= 1)
    })
    .await;

    // Brokered growth until all three are pairwise connected. One request
    // in flight at a time, the way the interval scheduler spaces them out.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !nodes.iter().all(|n| n.registry().connected_count() == 2) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "mesh never became full"
        );
        if let Some(node) = nodes.iter().find(|n| n.registry().connected_count() < 2) {
            node.request_introduction().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for node in &nodes {
        node.close().await;
    }
    server.abort();
}

#[tokio::test]
async fn brokered_handshake_records_symmetric_relations_on_all_parties() {
    let hub = MemoryHub::new();
    let a = node_on(&hub, vec!["ws://unused".to_string()]);
    let b = node_on(&hub, vec!["ws://unused".to_string()]);
    let c = node_on(&hub, vec!["ws://unused".to_string()]);
    a.set_local_id("a".to_string());
    b.set_local_id("b".to_string());
    c.set_local_id("c".to_string());

    // b is connected to both ends and will broker a toward c.
    connect_directly(&a, &b).await;
    connect_directly(&b, &c).await;

    a.request_introduction().await;

    wait_until("brokered link between a and c", || {
        a.registry().connected_ids().contains(&"c".to_string())
            && c.registry().connected_ids().contains(&"a".to_string())
    })
    .await;

    // The broker remembers the pair symmetrically under its own id, and both
    // introduced peers remember who brokered them.
    assert_eq!(b.coordinator().lookup("b", "a"), Some("c".to_string()));
    assert_eq!(b.coordinator().lookup("b", "c"), Some("a".to_string()));
    assert_eq!(a.coordinator().lookup("b", "c"), Some("a".to_string()));
    assert_eq!(c.coordinator().lookup("b", "a"), Some("c".to_string()));

    // The brokered links route their candidates through the broker.
    assert!(a.registry().get("c").unwrap().is_proxy());
    assert!(c.registry().get("a").unwrap().is_proxy());
}

#[tokio::test]
async fn broker_without_spare_peers_reports_none_available() {
    let hub = MemoryHub::new();
    let a = node_on(&hub, vec!["ws://unused".to_string()]);
    let b = node_on(&hub, vec!["ws://unused".to_string()]);
    a.set_local_id("a".to_string());
    b.set_local_id("b".to_string());

    connect_directly(&a, &b).await;

    let none_seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&none_seen);
    let _sub = a.events().subscribe(move |event: &MeshEvent| {
        if matches!(event, MeshEvent::NoPeersAvailable { via } if via == "b") {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    a.request_introduction().await;

    wait_until("broker replied no-peers-available", || {
        none_seen.load(Ordering::SeqCst) >= 1
    })
    .await;
    assert_eq!(a.registry().len(), 1);
}

#[tokio::test]
async fn departed_peer_is_forgotten_everywhere() {
    let hub = MemoryHub::new();
    let a = node_on(&hub, vec!["ws://unused".to_string()]);
    let b = node_on(&hub, vec!["ws://unused".to_string()]);
    let c = node_on(&hub, vec!["ws://unused".to_string()]);
    a.set_local_id("a".to_string());
    b.set_local_id("b".to_string());
    c.set_local_id("c".to_string());

    connect_directly(&a, &b).await;
    connect_directly(&b, &c).await;
    a.request_introduction().await;
    wait_until("full mesh", || {
        a.registry().connected_count() == 2 && c.registry().connected_count() == 2
    })
    .await;

    let removed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&removed);
    let _sub = a.events().subscribe(move |event: &MeshEvent| {
        if matches!(event, MeshEvent::PeerRemoved { peer_id } if peer_id == "c") {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    // c drops its link to a; a observes the terminal state and cleans up.
    let doomed = c.registry().get("a").unwrap();
    c.cleanup_link(&doomed).await;

    wait_until("a forgot c", || !a.registry().contains("c")).await;
    wait_until("removal event emitted", || removed.load(Ordering::SeqCst) >= 1).await;

    // Relation table entries mentioning c are pruned on a.
    assert_eq!(a.coordinator().lookup("b", "c"), None);
    // c's own side forgot a as well.
    assert!(!c.registry().contains("a"));
}
