//! Integration tests for the Node public API.
//!
//! Every node here is a real QUIC endpoint on loopback, so these tests cover the
//! full path: certificates, framing, dispatch and the mesh protocols on top.

use std::time::Duration;

use tapestry::{classify, MeshConfig, Node, NodeConfig, NodeId, TapestryError};
use tokio::time::timeout;

/// Port 0 lets the OS pick, so parallel tests never collide.
const TEST_ADDR: &str = "127.0.0.1:0";

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn fast_config(id: Option<&str>) -> NodeConfig {
    NodeConfig {
        id: id.map(|s| NodeId::parse(s).expect("valid identifier")),
        advertise: None,
        mesh: MeshConfig {
            rpc_timeout: Duration::from_millis(750),
            rpc_attempts: 1,
            ..MeshConfig::default()
        },
    }
}

async fn bind(id: &str) -> Node {
    Node::bind_with_config(TEST_ADDR, fast_config(Some(id)))
        .await
        .expect("bind failed")
}

fn addr_of(node: &Node) -> String {
    node.local_addr().expect("local_addr failed").to_string()
}

/// Bind one node per identifier; all but the first join through the first.
async fn mesh_of(ids: &[&str]) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::new();
    for id in ids {
        let node = bind(id).await;
        if let Some(seed) = nodes.first() {
            timeout(TEST_TIMEOUT, node.join(&addr_of(seed)))
                .await
                .expect("join timed out")
                .expect("join failed");
        }
        nodes.push(node);
    }
    nodes
}

#[tokio::test]
async fn node_bind_and_identity() {
    let node = Node::bind(TEST_ADDR).await.expect("bind failed");

    let identity = node.identity();
    assert_eq!(identity.len(), 40, "identity should be 40 hex digits");
    assert!(identity.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(node.node_id(), node.keypair().node_id());

    let local_addr = node.local_addr().expect("local_addr failed");
    assert!(local_addr.port() > 0, "port should be assigned");
    assert_eq!(node.remote_node().addr, local_addr.to_string());
    assert_eq!(node.quic_endpoint().local_addr().unwrap(), local_addr);
}

#[tokio::test]
async fn short_identifier_is_zero_padded() {
    let node = Node::bind_with_id(TEST_ADDR, "abc").await.expect("bind failed");
    assert_eq!(node.identity(), format!("abc{}", "0".repeat(37)));
}

#[tokio::test]
async fn invalid_identifier_rejected() {
    let too_long = "1".repeat(41);
    for bad in ["", "xyz", too_long.as_str()] {
        let err = match Node::bind_with_id(TEST_ADDR, bad).await {
            Ok(_) => panic!("{bad:?} should be rejected"),
            Err(e) => e,
        };
        assert!(
            matches!(classify(&err), Some(TapestryError::InvalidIdentifier { .. })),
            "unexpected error for {bad:?}: {err:#}"
        );
    }
}

#[tokio::test]
async fn lone_node_stores_and_serves_blobs() {
    let node = bind("5").await;

    node.store("solo", b"value".to_vec()).await.expect("store failed");
    assert_eq!(node.get("solo").await.unwrap(), b"value".to_vec());
    assert_eq!(node.fetch("solo").await.unwrap(), vec![node.remote_node().clone()]);

    let root = node.find_root(NodeId::random()).await.unwrap();
    assert_eq!(root.id, node.node_id());
}

#[tokio::test]
async fn two_node_join_store_and_get() {
    let nodes = mesh_of(&["100", "200"]).await;
    let (seed, joiner) = (&nodes[0], &nodes[1]);

    assert_eq!(seed.snapshot().await.routing_entries, 1);
    assert_eq!(joiner.snapshot().await.routing_entries, 1);

    joiner
        .store("greeting", b"hello".to_vec())
        .await
        .expect("store failed");

    let value = timeout(TEST_TIMEOUT, seed.get("greeting"))
        .await
        .expect("get timed out")
        .expect("get failed");
    assert_eq!(value, b"hello".to_vec());

    let holders = seed.fetch("greeting").await.unwrap();
    assert_eq!(holders, vec![joiner.remote_node().clone()]);
}

#[tokio::test]
async fn members_agree_on_the_root() {
    let nodes = mesh_of(&["100", "120", "200"]).await;
    let target = NodeId::parse("123").unwrap();

    for node in &nodes {
        let root = timeout(TEST_TIMEOUT, node.find_root(target))
            .await
            .expect("lookup timed out")
            .expect("lookup failed");
        assert_eq!(root.id, NodeId::parse("120").unwrap());
    }
}

#[tokio::test]
async fn missing_key_is_not_found() {
    let nodes = mesh_of(&["100", "200"]).await;

    let err = nodes[0].get("never-stored").await.expect_err("nothing stored");
    assert!(matches!(classify(&err), Some(TapestryError::NotFound { .. })));
    assert!(nodes[1].fetch("never-stored").await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_identifier_rejected() {
    let nodes = mesh_of(&["100", "200"]).await;

    let impostor = bind("100").await;
    let err = timeout(TEST_TIMEOUT, impostor.join(&addr_of(&nodes[1])))
        .await
        .expect("join timed out")
        .expect_err("identifier already taken");
    assert!(matches!(classify(&err), Some(TapestryError::DuplicateIdentifier { .. })));
}

#[tokio::test]
async fn join_through_dead_seed_fails() {
    let dead = bind("300").await;
    let dead_addr = addr_of(&dead);
    dead.kill().await;

    let node = bind("400").await;
    let err = timeout(TEST_TIMEOUT, node.join(&dead_addr))
        .await
        .expect("join timed out")
        .expect_err("seed is gone");
    assert!(matches!(classify(&err), Some(TapestryError::JoinUnreachable { .. })));
}

#[tokio::test]
async fn graceful_leave_keeps_objects_reachable() {
    let nodes = mesh_of(&["100", "200", "300"]).await;
    let (reader, leaving, holder) = (&nodes[0], &nodes[1], &nodes[2]);

    holder.store("doc", b"contents".to_vec()).await.expect("store failed");
    leaving.leave().await.expect("leave failed");

    assert!(!reader.mesh().has_route(&leaving.node_id()).await);
    assert!(!holder.mesh().has_route(&leaving.node_id()).await);

    let value = timeout(TEST_TIMEOUT, reader.get("doc"))
        .await
        .expect("get timed out")
        .expect("get failed");
    assert_eq!(value, b"contents".to_vec());
}

#[tokio::test]
async fn crashed_member_is_routed_around() {
    let nodes = mesh_of(&["100", "200", "300", "400"]).await;
    let crashed = &nodes[2];
    crashed.kill().await;

    let writer = &nodes[3];
    let reader = &nodes[0];
    for i in 0..8 {
        let key = format!("item-{i}");
        timeout(TEST_TIMEOUT, writer.store(&key, vec![i as u8]))
            .await
            .expect("store timed out")
            .expect("store failed");
        let value = timeout(TEST_TIMEOUT, reader.get(&key))
            .await
            .expect("get timed out")
            .expect("get failed");
        assert_eq!(value, vec![i as u8]);
    }
}

#[tokio::test]
async fn dropped_node_stops_serving() {
    let dropped = bind("300").await;
    let dropped_addr = addr_of(&dropped);
    drop(dropped);

    let node = bind("400").await;
    let err = timeout(TEST_TIMEOUT, node.join(&dropped_addr))
        .await
        .expect("join timed out")
        .expect_err("nobody serves the dropped address");
    assert!(matches!(classify(&err), Some(TapestryError::JoinUnreachable { .. })));
}
