//! Multi-node cluster scenarios over real loopback connections.

use std::time::Duration;

use weft::network::grpc::PeerConfig;
use weft::network::node::WeftPeer;
use weft::tapestry::id::Id;

async fn create_cluster(count: usize) -> Vec<WeftPeer> {
    let mut peers: Vec<WeftPeer> = Vec::with_capacity(count);
    for i in 0..count {
        let peer = WeftPeer::new(PeerConfig::default())
            .await
            .expect("failed to create node");

        if i > 0 {
            let bootstrap = vec![peers[0].address().to_string()];
            let mut joined = false;
            for _ in 0..3 {
                if peer.join(&bootstrap).await.is_ok() {
                    joined = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            assert!(joined, "node {} failed to join the cluster", i);
        }

        peer.spawn_workers();
        peers.push(peer);
    }

    // Let reciprocal bonds and backpointer notifications settle.
    tokio::time::sleep(Duration::from_secs(2)).await;
    peers
}

fn stop_cluster(peers: &[WeftPeer]) {
    for peer in peers {
        peer.node().signal_shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn mesh_converges() {
    let peers = create_cluster(5).await;

    let total: usize = peers.iter().map(|p| p.node().table.size()).sum();
    stop_cluster(&peers);
    assert!(total > 0, "network failed to converge");
}

#[tokio::test(flavor = "multi_thread")]
async fn basic_dolr_round_trip() {
    let peers = create_cluster(3).await;

    peers[0]
        .node()
        .store_and_publish("my-secret", b"is-secure".to_vec())
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let obj = peers[2].node().get("my-secret").await.expect("get failed");
    assert_eq!(obj.data, b"is-secure");
    stop_cluster(&peers);
}

#[tokio::test(flavor = "multi_thread")]
async fn replication_survives_publisher_failure() {
    let peers = create_cluster(5).await;

    peers[0]
        .node()
        .store_and_publish("resilient-key", b"cannot-kill-me".to_vec())
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    peers[0].node().signal_shutdown();

    let obj = peers[4]
        .node()
        .get("resilient-key")
        .await
        .expect("failover get failed");
    assert_eq!(obj.data, b"cannot-kill-me");
    stop_cluster(&peers);
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_leave_hands_off_objects() {
    let peers = create_cluster(3).await;

    peers[0]
        .node()
        .store_and_publish("handoff-key", b"take-this".to_vec())
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    peers[0].leave().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let obj = peers[1]
        .node()
        .get("handoff-key")
        .await
        .expect("handoff get failed");
    assert_eq!(obj.data, b"take-this");
    stop_cluster(&peers[1..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn singleton_node_is_its_own_root_over_the_wire() {
    let peer = WeftPeer::new(PeerConfig::default())
        .await
        .expect("failed to create node");
    let node = peer.node();

    let mut client = node.pool.client(peer.address()).await.expect("dial failed");
    let (next_hop, is_root) = client
        .get_next_hop(&Id::hash("anything"))
        .await
        .expect("rpc failed");

    assert!(is_root);
    assert_eq!(next_hop.id, node.id);
    node.signal_shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_object_reports_not_found() {
    let peers = create_cluster(2).await;

    let err = peers[1].node().get("never-stored").await;
    assert!(err.is_err());
    stop_cluster(&peers);
}
