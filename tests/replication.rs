//! Replication between real nodes on ephemeral ports
//!
//! Each test owns a multi-threaded runtime that runs the HTTP servers and the
//! replication workers; stores are driven from the test thread.

use llamakv::backend::MemoryBackend;
use llamakv::cache::LruCache;
use llamakv::config::{DistributedConfig, ServerConfig};
use llamakv::core::{Key, Payload, Value};
use llamakv::distributed::{DistributedClient, DistributedServer, Replicator};
use llamakv::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

const REFUSED_PEER: &str = "http://127.0.0.1:1";

struct Node {
    store: Arc<Store>,
    url: String,
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn memory_store() -> Store {
    Store::new(
        Box::new(MemoryBackend::new()),
        Box::new(LruCache::new(128).unwrap()),
    )
}

fn start_node(
    rt: &Runtime,
    cancel: &CancellationToken,
    node_id: &str,
    config: ServerConfig,
    store: Store,
) -> Node {
    let store = Arc::new(store);
    let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server =
        DistributedServer::new(&config, node_id, Arc::clone(&store), cancel.clone()).unwrap();
    rt.spawn(async move { server.serve(listener).await });
    Node { store, url }
}

fn client_config(peers: Vec<String>) -> DistributedConfig {
    DistributedConfig {
        peers,
        retry_attempts: 1,
        retry_interval_ms: 10,
        connect_timeout_ms: 1000,
        read_timeout_ms: 2000,
        ..DistributedConfig::default()
    }
}

fn new_client(rt: &Runtime, config: DistributedConfig, node_id: &str) -> DistributedClient {
    DistributedClient::builder(config, node_id)
        .runtime(rt.handle().clone())
        .build()
        .unwrap()
}

fn replicated_store(client: &Arc<DistributedClient>) -> Store {
    memory_store().with_replicator(Arc::clone(client) as Arc<dyn Replicator>)
}

#[test]
fn test_mutations_reach_peer() {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let peer = start_node(&rt, &cancel, "node-b", ServerConfig::default(), memory_store());

    let client = Arc::new(new_client(&rt, client_config(vec![peer.url.clone()]), "node-a"));
    let local = replicated_store(&client);

    local.set("x", "1").unwrap();
    local.set("ns:n", 42i64).unwrap();
    assert!(rt.block_on(client.wait_idle(Duration::from_secs(5))));
    assert_eq!(peer.store.get("x").unwrap(), Some(Payload::from("1")));
    assert_eq!(peer.store.get("ns:n").unwrap(), Some(Payload::Int(42)));

    local.delete("x").unwrap();
    assert!(rt.block_on(client.wait_idle(Duration::from_secs(5))));
    assert!(!peer.store.exists("x").unwrap());

    local.clear().unwrap();
    assert!(rt.block_on(client.wait_idle(Duration::from_secs(5))));
    assert!(!peer.store.exists("ns:n").unwrap());

    let stats = client.stats();
    assert_eq!(stats.propagations_sent, 4);
    assert_eq!(stats.propagations_failed, 0);
    assert_eq!(stats.nodes_down, 0);

    rt.block_on(client.shutdown());
    cancel.cancel();
    drop(rt);
}

#[test]
fn test_local_write_survives_unreachable_peers() {
    let rt = runtime();
    let client = Arc::new(new_client(
        &rt,
        client_config(vec![REFUSED_PEER.to_string()]),
        "node-a",
    ));
    let local = replicated_store(&client);

    local.set("k", "v").unwrap();
    assert!(rt.block_on(client.wait_idle(Duration::from_secs(5))));
    assert_eq!(local.get("k").unwrap(), Some(Payload::from("v")));

    let stats = client.stats();
    assert_eq!(stats.propagations_failed, 1);
    assert_eq!(stats.nodes_down, 1);
    rt.block_on(client.shutdown());
}

#[test]
fn test_own_propagation_is_skipped() {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let node = start_node(&rt, &cancel, "node-a", ServerConfig::default(), memory_store());

    // a client carrying the receiving node's own id
    let mut config = client_config(vec![node.url.clone()]);
    config.async_updates = false;
    let client = new_client(&rt, config, "node-a");

    assert!(client.propagate_set(&Key::new("x"), &Value::new("1")));
    assert!(!node.store.exists("x").unwrap());

    rt.block_on(client.shutdown());
    cancel.cancel();
    drop(rt);
}

#[test]
fn test_propagation_is_single_hop() {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let far = start_node(&rt, &cancel, "node-c", ServerConfig::default(), memory_store());

    let middle_client =
        Arc::new(new_client(&rt, client_config(vec![far.url.clone()]), "node-b"));
    let middle = start_node(
        &rt,
        &cancel,
        "node-b",
        ServerConfig::default(),
        replicated_store(&middle_client),
    );

    let origin =
        Arc::new(new_client(&rt, client_config(vec![middle.url.clone()]), "node-a"));
    let local = replicated_store(&origin);

    local.set("hop", "1").unwrap();
    assert!(rt.block_on(origin.wait_idle(Duration::from_secs(5))));
    assert!(rt.block_on(middle_client.wait_idle(Duration::from_secs(5))));

    assert!(middle.store.exists("hop").unwrap());
    assert!(!far.store.exists("hop").unwrap());
    assert_eq!(middle_client.stats().propagations_sent, 0);

    rt.block_on(origin.shutdown());
    rt.block_on(middle_client.shutdown());
    cancel.cancel();
    drop(rt);
}

#[test]
fn test_bearer_token_between_nodes() {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let server_config = ServerConfig {
        auth_token: Some("s3cret".to_string()),
        ..ServerConfig::default()
    };
    let peer = start_node(&rt, &cancel, "node-b", server_config, memory_store());

    let mut config = client_config(vec![peer.url.clone()]);
    config.async_updates = false;

    let anonymous = new_client(&rt, config.clone(), "node-a");
    assert!(!anonymous.propagate_set(&Key::new("a"), &Value::new("1")));
    assert_eq!(anonymous.stats().nodes_down, 1);

    let authed = DistributedClient::builder(config, "node-a")
        .auth_token(Some("s3cret".to_string()))
        .runtime(rt.handle().clone())
        .build()
        .unwrap();
    assert!(authed.propagate_set(&Key::new("a"), &Value::new("1")));
    assert_eq!(peer.store.get("a").unwrap(), Some(Payload::from("1")));

    rt.block_on(anonymous.shutdown());
    rt.block_on(authed.shutdown());
    cancel.cancel();
    drop(rt);
}

#[test]
fn test_get_remote_skips_down_peer() {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let peer = start_node(&rt, &cancel, "node-b", ServerConfig::default(), memory_store());
    peer.store.set("k", "v").unwrap();

    let mut config = client_config(vec![REFUSED_PEER.to_string(), peer.url.clone()]);
    config.async_updates = false;
    let client = new_client(&rt, config, "node-a");

    // first read marks the refused peer down
    let value = rt.block_on(client.get_remote(&Key::new("k"))).unwrap();
    assert_eq!(value.payload(), &Payload::from("v"));
    let stats = client.stats();
    assert!(stats.peers[0].down);
    let refused_attempts = stats.peers[0].attempts;

    let value = rt.block_on(client.get_remote(&Key::new("k"))).unwrap();
    assert_eq!(value.payload(), &Payload::from("v"));
    let stats = client.stats();
    assert_eq!(stats.peers[0].attempts, refused_attempts);
    assert_eq!(stats.peers[1].attempts, 2);

    // 404 is a definitive miss
    assert!(rt.block_on(client.get_remote(&Key::new("missing"))).is_none());
    assert_eq!(client.stats().reads_sent, 3);

    rt.block_on(client.shutdown());
    cancel.cancel();
    drop(rt);
}

fn mixed_fanout(concurrent_fanout: bool) {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let peer = start_node(&rt, &cancel, "node-b", ServerConfig::default(), memory_store());

    let mut config = client_config(vec![REFUSED_PEER.to_string(), peer.url.clone()]);
    config.async_updates = false;
    config.concurrent_fanout = concurrent_fanout;
    let client = new_client(&rt, config, "node-a");

    assert!(client.propagate_set(&Key::new("fan"), &Value::new("out")));
    assert_eq!(peer.store.get("fan").unwrap(), Some(Payload::from("out")));

    let stats = client.stats();
    assert_eq!(stats.propagations_sent, 1);
    assert_eq!(stats.propagations_failed, 0);
    assert_eq!(stats.nodes_down, 1);
    assert_eq!(stats.peers[0].attempts, 1);
    assert!(stats.peers[0].down);
    assert_eq!(stats.peers[0].failures, 1);
    assert_eq!(stats.peers[1].attempts, 1);
    assert_eq!(stats.peers[1].successes, 1);
    assert!(!stats.peers[1].down);

    // the refused peer is now skipped, the live one still receives updates
    assert!(client.propagate_delete(&Key::new("fan")));
    assert!(!peer.store.exists("fan").unwrap());
    let stats = client.stats();
    assert_eq!(stats.peers[0].attempts, 1);
    assert_eq!(stats.peers[1].attempts, 2);

    rt.block_on(client.shutdown());
    cancel.cancel();
    drop(rt);
}

#[test]
fn test_sequential_fanout_with_one_peer_down() {
    mixed_fanout(false);
}

#[test]
fn test_concurrent_fanout_with_one_peer_down() {
    mixed_fanout(true);
}

#[test]
fn test_concurrent_fanout_from_async_worker() {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let first = start_node(&rt, &cancel, "node-b", ServerConfig::default(), memory_store());
    let second = start_node(&rt, &cancel, "node-c", ServerConfig::default(), memory_store());

    let mut config = client_config(vec![
        first.url.clone(),
        REFUSED_PEER.to_string(),
        second.url.clone(),
    ]);
    config.concurrent_fanout = true;
    let client = Arc::new(new_client(&rt, config, "node-a"));
    let local = replicated_store(&client);

    local.set("a", "1").unwrap();
    local.set("b", "2").unwrap();
    assert!(rt.block_on(client.wait_idle(Duration::from_secs(5))));

    for node in [&first, &second] {
        assert_eq!(node.store.get("a").unwrap(), Some(Payload::from("1")));
        assert_eq!(node.store.get("b").unwrap(), Some(Payload::from("2")));
    }
    let stats = client.stats();
    assert_eq!(stats.propagations_sent, 2);
    assert_eq!(stats.nodes_down, 1);
    assert!(stats.peers[1].down);

    rt.block_on(client.shutdown());
    cancel.cancel();
    drop(rt);
}
