use std::time::{Duration, Instant};

use concord_node::{Node, NodeConfig};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn node_config(name: &str, port: u16, cluster: &str, dir: &TempDir) -> NodeConfig {
    NodeConfig {
        node_id: name.to_string(),
        node_host: "127.0.0.1".to_string(),
        node_port: port,
        cluster_nodes: cluster.to_string(),
        heartbeat_interval: 0.05,
        election_timeout_min: 0.15,
        election_timeout_max: 0.3,
        cache_size: 64,
        cache_policy: "LRU".to_string(),
        cache_protocol: "MESI".to_string(),
        queue_replication_factor: 2,
        lease_timeout: 60.0,
        log_level: "warn".to_string(),
        data_dir: dir.path().to_path_buf(),
    }
}

fn singleton_config(name: &str, port: u16, dir: &TempDir) -> NodeConfig {
    node_config(name, port, &format!("{}:{}", name, port), dir)
}

/// One JSON request per connection: write, close the write side, read the
/// reply.
async fn rpc(port: u16, request: Value) -> Value {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.to_string().as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    serde_json::from_slice(&buf).unwrap()
}

async fn wait_for_leader(lock_port: u16) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let info = rpc(lock_port, json!({"action": "info"})).await;
        if info["state"] == "leader" {
            return;
        }
        assert!(Instant::now() < deadline, "node never became leader: {}", info);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn exclusive_lock_contention_end_to_end() {
    let dir = TempDir::new().unwrap();
    let node = Node::start(singleton_config("n1", 18100, &dir)).await.unwrap();
    wait_for_leader(18100).await;

    let acquired = rpc(18100, json!({
        "action": "acquire", "lock_id": "k", "requester_id": "c1",
        "lock_type": "exclusive", "timeout": 30,
    }))
    .await;
    assert_eq!(acquired["status"], "acquired");
    assert_eq!(acquired["holder_id"], "c1");

    let waiting = rpc(18100, json!({
        "action": "acquire", "lock_id": "k", "requester_id": "c2",
        "lock_type": "exclusive", "timeout": 30,
    }))
    .await;
    assert_eq!(waiting["status"], "waiting");
    assert_eq!(waiting["queue_position"], 1);

    let released = rpc(18100, json!({
        "action": "release", "lock_id": "k", "holder_id": "c1",
    }))
    .await;
    assert_eq!(released["status"], "released");

    // The waiter was admitted by the release.
    let status = rpc(18100, json!({"action": "status", "lock_id": "k"})).await;
    assert_eq!(status["status"], "found");
    assert_eq!(status["holders"], json!(["c2"]));
    assert_eq!(status["waiting_count"], 0);

    node.shutdown();
}

#[tokio::test]
async fn deadlock_is_reported_and_nothing_is_preempted() {
    let dir = TempDir::new().unwrap();
    let node = Node::start(singleton_config("n1", 18500, &dir)).await.unwrap();
    wait_for_leader(18500).await;

    for (lock, owner) in [("A", "c1"), ("B", "c2")] {
        let reply = rpc(18500, json!({
            "action": "acquire", "lock_id": lock, "requester_id": owner,
            "lock_type": "exclusive", "timeout": 30,
        }))
        .await;
        assert_eq!(reply["status"], "acquired");
    }

    let waiting = rpc(18500, json!({
        "action": "acquire", "lock_id": "B", "requester_id": "c1",
        "lock_type": "exclusive", "timeout": 30,
    }))
    .await;
    assert_eq!(waiting["status"], "waiting");

    let deadlock = rpc(18500, json!({
        "action": "acquire", "lock_id": "A", "requester_id": "c2",
        "lock_type": "exclusive", "timeout": 30,
    }))
    .await;
    assert_eq!(deadlock["status"], "error");
    assert_eq!(deadlock["message"], "Deadlock detected");

    let status_a = rpc(18500, json!({"action": "status", "lock_id": "A"})).await;
    assert_eq!(status_a["holders"], json!(["c1"]));

    node.shutdown();
}

#[tokio::test]
async fn queue_delivers_in_priority_order() {
    let dir = TempDir::new().unwrap();
    let node = Node::start(singleton_config("n1", 18900, &dir)).await.unwrap();
    wait_for_leader(18900).await;
    let queue_port = 19000;

    let created = rpc(queue_port, json!({"action": "create", "queue_name": "Q"})).await;
    assert_eq!(created["status"], "success");

    for (msg, priority) in [("low", 1), ("high", 5), ("medium", 3)] {
        let reply = rpc(queue_port, json!({
            "action": "enqueue", "queue_name": "Q",
            "message_data": {"msg": msg}, "priority": priority,
        }))
        .await;
        assert_eq!(reply["status"], "success");
        assert!(reply["message_id"].is_string());
    }

    for expected in ["high", "medium", "low"] {
        let reply = rpc(queue_port, json!({
            "action": "dequeue", "queue_name": "Q", "consumer_id": "c1",
        }))
        .await;
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["message"]["data"]["msg"], expected);
    }

    node.shutdown();
}

#[tokio::test]
async fn at_least_once_with_dead_letter_after_three_attempts() {
    let dir = TempDir::new().unwrap();
    let node = Node::start(singleton_config("n1", 19300, &dir)).await.unwrap();
    wait_for_leader(19300).await;
    let queue_port = 19400;

    let enqueued = rpc(queue_port, json!({
        "action": "enqueue", "queue_name": "Q", "message_data": {"job": 1}, "priority": 0,
    }))
    .await;
    let message_id = enqueued["message_id"].as_str().unwrap().to_string();

    for attempt in 1..=3u64 {
        let reply = rpc(queue_port, json!({
            "action": "dequeue", "queue_name": "Q", "consumer_id": "c1",
        }))
        .await;
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["message"]["attempts"], attempt);

        let nacked = rpc(queue_port, json!({
            "action": "nack", "message_id": message_id, "queue_name": "Q",
        }))
        .await;
        if attempt < 3 {
            assert_eq!(nacked["status"], "requeued");
        } else {
            assert_eq!(nacked["status"], "failed");
            assert_eq!(nacked["reason"], "Max attempts reached");
        }
    }

    let empty = rpc(queue_port, json!({
        "action": "dequeue", "queue_name": "Q", "consumer_id": "c1",
    }))
    .await;
    assert_eq!(empty["status"], "empty");

    node.shutdown();
}

#[tokio::test]
async fn cache_miss_put_hit_cycle() {
    let dir = TempDir::new().unwrap();
    let node = Node::start(singleton_config("n1", 19700, &dir)).await.unwrap();
    wait_for_leader(19700).await;
    let cache_port = 19900;

    let miss = rpc(cache_port, json!({"action": "get", "key": "u:1"})).await;
    assert_eq!(miss["status"], "miss");

    let put = rpc(cache_port, json!({
        "action": "put", "key": "u:1", "value": {"name": "A"},
    }))
    .await;
    assert_eq!(put["status"], "success");
    assert_eq!(put["state"], "exclusive");
    assert_eq!(put["version"], 1);

    let hit = rpc(cache_port, json!({"action": "get", "key": "u:1"})).await;
    assert_eq!(hit["status"], "hit");
    assert_eq!(hit["value"], json!({"name": "A"}));
    assert_eq!(hit["version"], 1);

    let stats = rpc(cache_port, json!({"action": "stats"})).await;
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["misses"], 1);

    node.shutdown();
}

#[tokio::test]
async fn unknown_actions_are_rejected() {
    let dir = TempDir::new().unwrap();
    let node = Node::start(singleton_config("n1", 20300, &dir)).await.unwrap();
    wait_for_leader(20300).await;

    let reply = rpc(20300, json!({"action": "explode"})).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["message"], "Unknown action");

    node.shutdown();
}

#[tokio::test]
async fn invalid_configuration_fails_startup() {
    let dir = TempDir::new().unwrap();
    let mut config = singleton_config("n1", 20700, &dir);
    config.cache_protocol = "MOESI".to_string();
    assert!(Node::start(config).await.is_err());
}

/// Poll every lock port until one node reports itself leader.
async fn find_leader(ports: &[u16]) -> u16 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        for &port in ports {
            let info = rpc(port, json!({"action": "info"})).await;
            if info["state"] == "leader" {
                return port;
            }
        }
        assert!(Instant::now() < deadline, "cluster never elected a leader");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn three_node_cluster_replicates_the_log_to_a_majority() {
    let dir = TempDir::new().unwrap();
    let cluster = "n1:21100,n2:21500,n3:21900";
    let ports = [21100u16, 21500, 21900];

    let mut nodes = Vec::new();
    for (name, port) in [("n1", 21100u16), ("n2", 21500), ("n3", 21900)] {
        nodes.push(Node::start(node_config(name, port, cluster, &dir)).await.unwrap());
    }

    let mut leader_port = find_leader(&ports).await;

    // Five exclusive acquires: the fifth command lands at log index 5.
    // Leadership can move under us, so follow the NotLeader hint by
    // re-discovering the leader and retrying. The window leaves room for
    // one full apply deadline on a deposed leader plus a retry.
    for i in 1..=5 {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let reply = rpc(leader_port, json!({
                "action": "acquire",
                "lock_id": format!("k{}", i),
                "requester_id": format!("c{}", i),
                "lock_type": "exclusive",
                "timeout": 30,
            }))
            .await;
            if reply["status"] == "acquired" {
                break;
            }
            assert!(Instant::now() < deadline, "command {} never accepted: {}", i, reply);
            tokio::time::sleep(Duration::from_millis(50)).await;
            leader_port = find_leader(&ports).await;
        }
    }

    // A majority of replicas applies index 5 and agrees on the term; the
    // replicated lock state is then readable on those replicas.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let mut infos = Vec::new();
        for &port in &ports {
            infos.push((port, rpc(port, json!({"action": "info"})).await));
        }
        let converged: Vec<&(u16, Value)> = infos
            .iter()
            .filter(|(_, info)| info["last_applied"].as_u64().unwrap_or(0) >= 5)
            .collect();

        if converged.len() >= 2 {
            let term = converged[0].1["term"].as_u64().unwrap();
            for (_, info) in &converged {
                assert_eq!(info["term"].as_u64().unwrap(), term);
                assert!(info["log_size"].as_u64().unwrap() >= 5);
            }
            for (port, _) in &converged {
                let status = rpc(*port, json!({"action": "status", "lock_id": "k5"})).await;
                assert_eq!(status["status"], "found", "replica {} missing k5: {}", port, status);
                assert_eq!(status["holders"], json!(["c5"]));
            }
            break;
        }
        assert!(
            Instant::now() < deadline,
            "replicas never converged on index 5: {:?}",
            infos
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for node in &nodes {
        node.shutdown();
    }
}
