//! Chain replication integration tests
//!
//! Every node is a real table server on a loopback port, registered in a
//! shared in-process coordination tree (or a TCP coordination server).

use chaindb_core::config::NetworkSettings;
use chaindb_core::coord::{CoordServer, Coordinator, RemoteCoordinator};
use chaindb_core::{
    ChainClient, ChainMembership, Database, DbError, DbResult, Dispatcher, DistributedDatabase,
    MemoryCoordinator, MembershipState, RemoteTable, TableServer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const CHAIN: &str = "/chain";

fn network() -> NetworkSettings {
    NetworkSettings {
        connect_timeout_ms: 1000,
        request_timeout_ms: 2000,
        ..NetworkSettings::default()
    }
}

struct TestNode {
    addr: String,
    ddb: Arc<DistributedDatabase>,
    membership: Arc<ChainMembership>,
    server: JoinHandle<()>,
    watcher: JoinHandle<DbResult<()>>,
}

impl TestNode {
    async fn start(coordinator: Arc<dyn Coordinator>) -> Self {
        let ddb = Arc::new(DistributedDatabase::new(Database::new(8).unwrap()));
        let server = TableServer::bind("127.0.0.1:0", Dispatcher::new(Arc::clone(&ddb)))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let server = tokio::spawn(server.serve());

        let membership = Arc::new(ChainMembership::new(
            coordinator,
            Arc::clone(&ddb),
            CHAIN,
            addr.clone(),
            network(),
        ));
        let watch = membership.join().await.unwrap();
        let watcher = {
            let membership = Arc::clone(&membership);
            tokio::spawn(async move { membership.run(watch).await })
        };

        Self {
            addr,
            ddb,
            membership,
            server,
            watcher,
        }
    }

    async fn join(coordinator: &MemoryCoordinator) -> Self {
        Self::start(Arc::new(coordinator.session())).await
    }

    async fn stop(self) {
        self.membership.leave().await.unwrap();
        self.server.abort();
        let _ = self.watcher.await;
    }

    async fn forwards_to(&self, expected: Option<&str>) -> bool {
        for _ in 0..200 {
            if self.ddb.replica_address().await.as_deref() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

async fn remote_session(addr: &str) -> Arc<dyn Coordinator> {
    Arc::new(
        RemoteCoordinator::connect(addr, Duration::from_secs(2))
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn test_migration_on_join() {
    let coordinator = MemoryCoordinator::new();
    let predecessor = TestNode::join(&coordinator).await;
    predecessor.ddb.put("a", b"1").await.unwrap();
    predecessor.ddb.put("b", b"2").await.unwrap();

    let joined = TestNode::join(&coordinator).await;

    assert_eq!(joined.ddb.get("a").unwrap(), b"1");
    assert_eq!(joined.ddb.get("b").unwrap(), b"2");
    assert_eq!(joined.ddb.size(), 2);
    assert!(predecessor.forwards_to(Some(joined.addr.as_str())).await);
}

#[tokio::test]
async fn test_three_node_propagation() {
    let coordinator = MemoryCoordinator::new();
    let head = TestNode::join(&coordinator).await;
    let middle = TestNode::join(&coordinator).await;
    let tail = TestNode::join(&coordinator).await;

    assert!(head.forwards_to(Some(middle.addr.as_str())).await);
    assert!(middle.forwards_to(Some(tail.addr.as_str())).await);
    assert!(tail.forwards_to(None).await);

    head.ddb.put("x", b"y").await.unwrap();
    assert_eq!(middle.ddb.get("x").unwrap(), b"y");
    assert_eq!(tail.ddb.get("x").unwrap(), b"y");

    head.ddb.remove("x").await.unwrap();
    assert_eq!(tail.ddb.size(), 0);

    // Writes sent over the wire to the head reach the tail as well
    let mut client = RemoteTable::connect_to(head.addr.clone(), network()).await.unwrap();
    client.put("k", b"v").await.unwrap();
    let mut tail_client = RemoteTable::connect_to(tail.addr.clone(), network()).await.unwrap();
    assert_eq!(tail_client.get("k").await.unwrap(), Some(b"v".to_vec()));
    assert_eq!(tail_client.keys().await.unwrap(), vec!["k".to_string()]);
}

#[tokio::test]
async fn test_successor_transition() {
    let coordinator = MemoryCoordinator::new();
    let a = TestNode::join(&coordinator).await;
    let b = TestNode::join(&coordinator).await;
    let c = TestNode::join(&coordinator).await;
    assert!(a.forwards_to(Some(b.addr.as_str())).await);
    assert!(b.forwards_to(Some(c.addr.as_str())).await);

    c.stop().await;
    assert!(b.forwards_to(None).await);
    assert_eq!(b.membership.state(), MembershipState::Registered { successor: None });

    // B is the tail now, so writes no longer leave B
    a.ddb.put("after", b"leave").await.unwrap();
    assert_eq!(b.ddb.get("after").unwrap(), b"leave");

    let replacement = TestNode::join(&coordinator).await;
    assert!(b.forwards_to(Some(replacement.addr.as_str())).await);
    assert_eq!(
        b.membership.state(),
        MembershipState::Registered {
            successor: replacement.membership.own_node()
        }
    );
    assert_eq!(replacement.ddb.get("after").unwrap(), b"leave");
    assert!(a.forwards_to(Some(b.addr.as_str())).await);
}

#[tokio::test]
async fn test_middle_node_leaving_relinks_chain() {
    let coordinator = MemoryCoordinator::new();
    let head = TestNode::join(&coordinator).await;
    let middle = TestNode::join(&coordinator).await;
    let tail = TestNode::join(&coordinator).await;
    assert!(head.forwards_to(Some(middle.addr.as_str())).await);

    middle.stop().await;
    assert!(head.forwards_to(Some(tail.addr.as_str())).await);

    head.ddb.put("k", b"v").await.unwrap();
    assert_eq!(tail.ddb.get("k").unwrap(), b"v");
}

#[tokio::test]
async fn test_chain_client_routes_to_ends() {
    let coordinator = MemoryCoordinator::new();
    let head = TestNode::join(&coordinator).await;
    let tail = TestNode::join(&coordinator).await;
    assert!(head.forwards_to(Some(tail.addr.as_str())).await);

    let client = ChainClient::connect(Arc::new(coordinator.session()), CHAIN, network())
        .await
        .unwrap();
    assert_eq!(client.head().await, head.membership.own_node());
    assert_eq!(client.tail().await, tail.membership.own_node());

    client.put("a", b"1").await.unwrap();
    assert_eq!(client.get("a").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(client.get("missing").await.unwrap(), None);
    assert_eq!(client.size().await.unwrap(), 1);
    assert_eq!(client.get_table().await.unwrap().len(), 1);

    // Reads hit the tail: its op counter moves, the head's write count does not
    let before = head.ddb.database().stats().op_counter;
    client.keys().await.unwrap();
    assert_eq!(head.ddb.database().stats().op_counter, before);
    assert!(client.stats().await.unwrap().op_counter >= 4);

    client.del("a").await.unwrap();
    assert_eq!(client.size().await.unwrap(), 0);

    let tail_node = tail.membership.own_node();
    tail.stop().await;
    let mut retargeted = false;
    for _ in 0..200 {
        if client.tail().await != tail_node {
            retargeted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(retargeted);
    assert_eq!(client.tail().await, head.membership.own_node());
    client.put("b", b"2").await.unwrap();
    assert_eq!(client.get("b").await.unwrap(), Some(b"2".to_vec()));
}

#[tokio::test]
async fn test_chain_over_coordination_server() {
    let coordination = CoordServer::bind("127.0.0.1:0", MemoryCoordinator::new())
        .await
        .unwrap();
    let coord_addr = coordination.local_addr().unwrap().to_string();
    tokio::spawn(coordination.serve());

    let head = TestNode::start(remote_session(&coord_addr).await).await;
    head.ddb.put("seed", b"1").await.unwrap();
    let tail = TestNode::start(remote_session(&coord_addr).await).await;

    assert_eq!(tail.ddb.get("seed").unwrap(), b"1");
    assert!(head.forwards_to(Some(tail.addr.as_str())).await);

    head.ddb.put("x", b"y").await.unwrap();
    assert_eq!(tail.ddb.get("x").unwrap(), b"y");

    tail.stop().await;
    assert!(head.forwards_to(None).await);
}

#[tokio::test]
async fn test_failed_forward_reports_error_but_keeps_write() {
    let coordinator = MemoryCoordinator::new();
    let head = TestNode::join(&coordinator).await;
    let tail = TestNode::join(&coordinator).await;
    assert!(head.forwards_to(Some(tail.addr.as_str())).await);

    head.ddb.put("k", b"v").await.unwrap();
    tail.ddb.database().remove("k").unwrap();

    // Local delete succeeds, the forwarded DEL is rejected by the tail
    let err = head.ddb.remove("k").await.unwrap_err();
    assert!(matches!(err, DbError::ForwardFailed { ref key, .. } if key == "k"));
    assert!(head.ddb.get("k").is_err());
    assert_eq!(head.ddb.size(), 0);
}
