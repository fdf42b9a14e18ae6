//! Two-node cluster tests over loopback TCP
//!
//! Both nodes run inside the test runtime; a raw RESP client drives them the
//! way redis-cli would.

use bytes::Bytes;
use cluster::{Cluster, ClusterConfig};
use redring::server::RespServer;
use resp::{to_cmd_line, AsyncRespEncoder, AsyncRespParser, RespValue};
use std::sync::Arc;
use std::time::Duration;
use storage::Store;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

struct TestClient {
    parser: AsyncRespParser<OwnedReadHalf>,
    encoder: AsyncRespEncoder<OwnedWriteHalf>,
}

impl TestClient {
    async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to node");
        let (read, write) = stream.into_split();
        Self {
            parser: AsyncRespParser::new(read),
            encoder: AsyncRespEncoder::new(write),
        }
    }

    async fn request(&mut self, parts: &[&str]) -> RespValue {
        let cmd = to_cmd_line(parts.iter().map(|s| s.to_string()));
        self.encoder
            .encode(&RespValue::from_cmd_line(cmd))
            .await
            .expect("send command");
        self.parser.parse().await.expect("read reply")
    }
}

/// Start two nodes that know each other. Listeners are bound before the
/// clusters are built, so there is no readiness race.
async fn start_pair() -> (Arc<Cluster>, Arc<Cluster>, String, String) {
    let l1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let l2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr1 = l1.local_addr().unwrap().to_string();
    let addr2 = l2.local_addr().unwrap().to_string();

    let c1 = spawn_node(&addr1, &[&addr2], l1);
    let c2 = spawn_node(&addr2, &[&addr1], l2);
    (c1, c2, addr1, addr2)
}

fn spawn_node(self_addr: &str, peers: &[&str], listener: TcpListener) -> Arc<Cluster> {
    let store = Arc::new(Store::new(16));
    let cluster = Cluster::new(
        ClusterConfig {
            self_addr: self_addr.to_string(),
            peers: peers.iter().map(|s| s.to_string()).collect(),
            replicas: 16,
        },
        store,
        None,
    );
    let server = RespServer::new(cluster.clone(), self_addr.parse().unwrap());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    cluster
}

/// One key owned by each node, from the coordinator's view.
fn pick_split_keys(cluster: &Cluster, addr1: &str, addr2: &str) -> (String, String) {
    let mut on_1 = None;
    let mut on_2 = None;
    for i in 0.. {
        let key = format!("key:{}", i);
        let owner = cluster.pick_node(&key);
        if owner == addr1 && on_1.is_none() {
            on_1 = Some(key);
        } else if owner == addr2 && on_2.is_none() {
            on_2 = Some(key);
        }
        if let (Some(a), Some(b)) = (&on_1, &on_2) {
            return (a.clone(), b.clone());
        }
    }
    unreachable!()
}

#[tokio::test]
async fn single_key_commands_are_relayed_to_the_owner() {
    let (c1, _c2, addr1, addr2) = start_pair().await;
    let (key1, key2) = pick_split_keys(&c1, &addr1, &addr2);

    let mut client = TestClient::connect(&addr1).await;
    assert_eq!(client.request(&["SET", &key2, "remote"]).await, RespValue::ok());
    assert_eq!(client.request(&["SET", &key1, "local"]).await, RespValue::ok());

    // the remote key is visible on its owner directly
    let mut client2 = TestClient::connect(&addr2).await;
    assert_eq!(
        client2.request(&["GET", &key2]).await,
        RespValue::BulkString(Bytes::from("remote"))
    );
    // and through relay from the other node
    assert_eq!(
        client2.request(&["GET", &key1]).await,
        RespValue::BulkString(Bytes::from("local"))
    );
}

#[tokio::test]
async fn mset_spanning_nodes_commits_everywhere() {
    let (c1, c2, addr1, addr2) = start_pair().await;
    let (key1, key2) = pick_split_keys(&c1, &addr1, &addr2);

    let mut client = TestClient::connect(&addr1).await;
    assert_eq!(
        client.request(&["MSET", &key1, "v1", &key2, "v2"]).await,
        RespValue::ok()
    );

    // both keys visible from both nodes
    for addr in [&addr1, &addr2] {
        let mut c = TestClient::connect(addr).await;
        assert_eq!(
            c.request(&["GET", &key1]).await,
            RespValue::BulkString(Bytes::from("v1"))
        );
        assert_eq!(
            c.request(&["GET", &key2]).await,
            RespValue::BulkString(Bytes::from("v2"))
        );
    }

    // transaction records linger on both participants, then are cleaned
    assert!(c1.tx_count() >= 1);
    assert!(c2.tx_count() >= 1);
    tokio::time::sleep(cluster::WAIT_BEFORE_CLEAN_TX + Duration::from_secs(1)).await;
    assert_eq!(c1.tx_count(), 0);
    assert_eq!(c2.tx_count(), 0);
}

#[tokio::test]
async fn mget_gathers_across_nodes_in_order() {
    let (c1, _c2, addr1, addr2) = start_pair().await;
    let (key1, key2) = pick_split_keys(&c1, &addr1, &addr2);

    let mut client = TestClient::connect(&addr1).await;
    client.request(&["MSET", &key1, "v1", &key2, "v2"]).await;

    assert_eq!(
        client.request(&["MGET", &key2, "missing", &key1]).await,
        RespValue::Array(vec![
            RespValue::BulkString(Bytes::from("v2")),
            RespValue::Null,
            RespValue::BulkString(Bytes::from("v1")),
        ])
    );
}

#[tokio::test]
async fn del_spanning_nodes_counts_all_removals() {
    let (c1, _c2, addr1, addr2) = start_pair().await;
    let (key1, key2) = pick_split_keys(&c1, &addr1, &addr2);

    let mut client = TestClient::connect(&addr1).await;
    client.request(&["MSET", &key1, "v1", &key2, "v2"]).await;
    assert_eq!(
        client.request(&["DEL", &key1, &key2, "missing"]).await,
        RespValue::Integer(2)
    );
    assert_eq!(client.request(&["GET", &key1]).await, RespValue::Null);
    assert_eq!(client.request(&["GET", &key2]).await, RespValue::Null);
}

#[tokio::test]
async fn msetnx_vote_abort_writes_nothing() {
    let (c1, _c2, addr1, addr2) = start_pair().await;
    let (key1, key2) = pick_split_keys(&c1, &addr1, &addr2);

    // the second node already holds one of the keys
    let mut client2 = TestClient::connect(&addr2).await;
    assert_eq!(client2.request(&["SET", &key2, "taken"]).await, RespValue::ok());

    let mut client = TestClient::connect(&addr1).await;
    let reply = client.request(&["MSETNX", &key1, "a", &key2, "b"]).await;
    assert!(reply.is_error(), "one existing key must abort the transaction");

    assert_eq!(client.request(&["GET", &key1]).await, RespValue::Null);
    assert_eq!(
        client.request(&["GET", &key2]).await,
        RespValue::BulkString(Bytes::from("taken")),
        "the existing value survives the aborted transaction"
    );
}

#[tokio::test]
async fn prepared_participants_abort_when_the_coordinator_goes_silent() {
    let (_c1, _c2, addr1, _addr2) = start_pair().await;

    // act as a coordinator that prepares and then crashes
    let mut coordinator = TestClient::connect(&addr1).await;
    assert_eq!(
        coordinator
            .request(&["PREPARE", "tx-silent", "SET", "k", "v"])
            .await,
        RespValue::ok()
    );
    drop(coordinator);

    tokio::time::sleep(cluster::MAX_LOCK_TIME + Duration::from_millis(500)).await;

    // the participant has rolled back; a late commit finds nothing usable
    let mut revived = TestClient::connect(&addr1).await;
    assert_eq!(
        revived.request(&["COMMIT", "tx-silent"]).await,
        RespValue::Integer(0)
    );
    assert_eq!(revived.request(&["GET", "k"]).await, RespValue::Null);
}
