// SPDX-License-Identifier: MIT

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use concord_cache::{CacheNode, GetResult, LogBackingStore};
use concord_core::{now_ms, port, ClusterMap, ConcordError, MessageKind, PeerId};
use concord_detector::{FailureDetector, DEFAULT_PHI_THRESHOLD};
use concord_lock::{LockApplied, LockCommand, LockMode, LockStatus};
use concord_queue::{QueueApplied, QueueCommand, QueuedMessage};
use concord_raft::{RaftConfig, RaftError, RaftMessage, RaftNode};
use concord_ring::HashRing;
use concord_transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::api::{CacheRequest, LockRequest, QueueRequest};
use crate::config::NodeConfig;
use crate::server::{self, RpcHandler};
use crate::state::{Applied, Command, Router};

/// Lock and lease sweeps run on this cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// How long a proposer waits for its command to commit and apply.
const APPLY_DEADLINE: Duration = Duration::from_secs(10);

/// Queue replication traffic between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueSync {
    Replicate { queue: String, message: QueuedMessage },
}

#[derive(Debug, Clone, Copy)]
enum Service {
    Lock,
    Queue,
    Cache,
}

/// One concord node: a Raft replica feeding the lock and queue state
/// machines, a coherent cache, a failure detector, and three client-facing
/// JSON RPC listeners.
pub struct Node {
    config: NodeConfig,
    cluster: ClusterMap,
    transport: Arc<Transport>,
    pub detector: Arc<FailureDetector>,
    ring: Arc<StdMutex<HashRing>>,
    raft: Arc<RaftNode>,
    pub cache: Arc<CacheNode>,
    pub state: Arc<Router>,
    shutdown: watch::Sender<bool>,
    enqueue_counter: AtomicU64,
}

impl Node {
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let cluster = config.cluster_map()?;
        let self_id = cluster.self_id();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let transport = Transport::new(self_id);
        for peer in cluster.peer_ids() {
            let addr = cluster.member(peer).unwrap().addr(port::PEER);
            transport.add_peer(peer, addr).await;
        }

        let detector = FailureDetector::new(
            DEFAULT_PHI_THRESHOLD,
            Duration::from_secs_f64(config.heartbeat_interval),
        );
        for peer in cluster.peer_ids() {
            detector.register_peer(peer).await;
        }

        let ring = Arc::new(StdMutex::new(HashRing::default()));
        {
            let mut ring = ring.lock().unwrap();
            for member in cluster.members() {
                ring.add_node(&member.name);
            }
        }

        // Membership follows the detector: dead peers leave the ring,
        // recovered peers rejoin.
        {
            let ring_cb = ring.clone();
            let cluster_cb = cluster.clone();
            detector
                .set_on_dead(Box::new(move |peer| {
                    if let Some(name) = cluster_cb.name_of(peer) {
                        ring_cb.lock().unwrap().remove_node(name);
                    }
                }))
                .await;
            let ring_cb = ring.clone();
            let cluster_cb = cluster.clone();
            detector
                .set_on_recovered(Box::new(move |peer| {
                    if let Some(name) = cluster_cb.name_of(peer) {
                        ring_cb.lock().unwrap().add_node(name);
                    }
                }))
                .await;
        }

        let state = Router::new();

        let (outbox_tx, mut outbox_rx) = mpsc::channel::<(PeerId, RaftMessage)>(1024);
        let raft = RaftNode::start(
            RaftConfig {
                id: self_id,
                members: (0..cluster.len() as PeerId).collect(),
                storage_path: config.data_dir.join(format!("{}.wal", config.node_id)),
                election_timeout_ms: config.election_timeout_ms(),
                heartbeat_interval_ms: config.heartbeat_interval_ms(),
            },
            state.clone(),
            outbox_tx,
            shutdown_rx.clone(),
        )
        .await?;

        let cache = CacheNode::new(
            self_id,
            cluster.peer_ids().collect(),
            config.cache_size,
            config.eviction_policy()?,
            transport.clone(),
            Box::new(LogBackingStore),
        );
        cache.clone().register().await;

        // Inbound peer traffic.
        {
            let raft_in = raft.clone();
            transport
                .register_handler(
                    MessageKind::Raft,
                    Box::new(move |envelope| {
                        let raft = raft_in.clone();
                        Box::pin(async move {
                            let message: RaftMessage = bincode::deserialize(&envelope.payload)?;
                            raft.handle_message(envelope.sender, message).await?;
                            Ok(None)
                        })
                    }),
                )
                .await;

            let detector_in = detector.clone();
            transport
                .register_handler(
                    MessageKind::Heartbeat,
                    Box::new(move |envelope| {
                        let detector = detector_in.clone();
                        Box::pin(async move {
                            detector.record_heartbeat(envelope.sender).await;
                            Ok(None)
                        })
                    }),
                )
                .await;

            let state_in = state.clone();
            transport
                .register_handler(
                    MessageKind::Queue,
                    Box::new(move |envelope| {
                        let state = state_in.clone();
                        Box::pin(async move {
                            let QueueSync::Replicate { queue, message } =
                                serde_json::from_slice(&envelope.payload)?;
                            state.queues.lock().unwrap().replicate_in(&queue, message);
                            Ok(None)
                        })
                    }),
                )
                .await;
        }

        // Outbound Raft pump: one task per message so a slow peer cannot
        // stall the pipeline.
        {
            let transport_out = transport.clone();
            tokio::spawn(async move {
                while let Some((peer, message)) = outbox_rx.recv().await {
                    let transport = transport_out.clone();
                    tokio::spawn(async move {
                        let Ok(payload) = bincode::serialize(&message) else {
                            return;
                        };
                        if let Err(e) =
                            transport.send(peer, MessageKind::Raft, payload, false).await
                        {
                            warn!("[Node] Raft send to peer {} failed: {:#}", peer, e);
                        }
                    });
                }
            });
        }

        transport
            .clone()
            .start(
                &format!("{}:{}", config.node_host, config.node_port + port::PEER),
                shutdown_rx.clone(),
            )
            .await?;

        // Client-facing listeners must bind before the node counts as up.
        let lock_listener = server::bind(&config.node_host, config.node_port + port::LOCK).await?;
        let queue_listener =
            server::bind(&config.node_host, config.node_port + port::QUEUE).await?;
        let cache_listener =
            server::bind(&config.node_host, config.node_port + port::CACHE).await?;

        info!(
            "[Node] {} up: lock={}, queue={}, cache={}, peers={}",
            config.node_id,
            config.node_port,
            config.node_port + port::QUEUE,
            config.node_port + port::CACHE,
            cluster.len() - 1,
        );

        let node = Arc::new(Self {
            config,
            cluster,
            transport,
            detector: detector.clone(),
            ring,
            raft,
            cache,
            state,
            shutdown: shutdown_tx,
            enqueue_counter: AtomicU64::new(0),
        });

        detector.start(shutdown_rx.clone());
        node.clone().spawn_heartbeats(shutdown_rx.clone());
        node.clone().spawn_lock_sweep(shutdown_rx.clone());
        node.clone().spawn_lease_sweep(shutdown_rx.clone());

        server::serve("LockRpc", lock_listener, shutdown_rx.clone(), node.clone().rpc_handler(Service::Lock));
        server::serve("QueueRpc", queue_listener, shutdown_rx.clone(), node.clone().rpc_handler(Service::Queue));
        server::serve("CacheRpc", cache_listener, shutdown_rx, node.clone().rpc_handler(Service::Cache));

        Ok(node)
    }

    pub fn shutdown(&self) {
        info!("[Node] {} shutting down", self.config.node_id);
        let _ = self.shutdown.send(true);
    }

    pub async fn is_leader(&self) -> bool {
        self.raft.is_leader().await
    }

    fn rpc_handler(self: Arc<Self>, service: Service) -> RpcHandler {
        let node = self;
        Arc::new(move |request| {
            let node = node.clone();
            Box::pin(async move {
                match service {
                    Service::Lock => node.handle_lock(request).await,
                    Service::Queue => node.handle_queue(request).await,
                    Service::Cache => node.handle_cache(request).await,
                }
            })
        })
    }

    // --- Background tasks ---

    fn spawn_heartbeats(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs_f64(self.config.heartbeat_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        for peer in self.cluster.peer_ids() {
                            let transport = self.transport.clone();
                            tokio::spawn(async move {
                                let _ = transport
                                    .send(peer, MessageKind::Heartbeat, Vec::new(), false)
                                    .await;
                            });
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_lock_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        if !self.raft.is_leader().await {
                            continue;
                        }
                        let expired = self.state.locks.lock().unwrap().expired_holders();
                        for (lock_id, holder) in expired {
                            warn!("[Lock] {} expired for {}", lock_id, holder);
                            let _ = self
                                .propose_and_wait(Command::Lock(LockCommand::Expire {
                                    lock_id,
                                    holder,
                                }))
                                .await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_lease_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let lease_ms = self.config.lease_timeout_ms();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        if !self.raft.is_leader().await {
                            continue;
                        }
                        let expired =
                            self.state.queues.lock().unwrap().expired_leases(lease_ms);
                        if !expired.is_empty() {
                            let _ = self
                                .propose_and_wait(Command::Queue(QueueCommand::ExpireLeases {
                                    message_ids: expired,
                                }))
                                .await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // --- Proposal path ---

    async fn propose_and_wait(&self, command: Command) -> Result<Applied, ConcordError> {
        if *self.shutdown.borrow() {
            return Err(ConcordError::Shutdown);
        }
        let bytes = serde_json::to_vec(&command)
            .map_err(|e| ConcordError::Transport(e.to_string()))?;
        let index = match self.raft.propose(bytes).await {
            Ok(index) => index,
            Err(RaftError::NotLeader { leader }) => {
                return Err(ConcordError::NotLeader {
                    leader: leader
                        .and_then(|id| self.cluster.name_of(id))
                        .map(str::to_string),
                })
            }
            Err(RaftError::Storage(e)) => {
                return Err(ConcordError::Transport(format!("{:#}", e)))
            }
        };
        self.state
            .wait_for(index, APPLY_DEADLINE, self.shutdown.subscribe())
            .await
    }

    fn error_reply(&self, error: ConcordError) -> Value {
        match error {
            ConcordError::NotLeader { leader } => {
                json!({"status": "error", "message": "Not the leader", "leader_id": leader})
            }
            other => json!({"status": "error", "message": other.to_string()}),
        }
    }

    // --- Lock service ---

    async fn handle_lock(&self, request: Value) -> Value {
        let request: LockRequest = match serde_json::from_value(request) {
            Ok(r) => r,
            Err(_) => return json!({"status": "error", "message": "Unknown action"}),
        };
        match request {
            LockRequest::Acquire { lock_id, requester_id, lock_type, timeout } => {
                self.acquire_lock(lock_id, requester_id, lock_type, timeout).await
            }
            LockRequest::Release { lock_id, holder_id } => {
                self.release_lock(lock_id, holder_id).await
            }
            LockRequest::Status { lock_id } => self.lock_status(lock_id),
            LockRequest::Info => self.node_info().await,
        }
    }

    async fn acquire_lock(
        &self,
        lock_id: String,
        requester: String,
        mode: LockMode,
        timeout: f64,
    ) -> Value {
        let command = Command::Lock(LockCommand::Acquire {
            lock_id,
            requester,
            mode,
            timeout_secs: timeout.max(0.0) as u64,
        });
        match self.propose_and_wait(command).await {
            Ok(Applied::Lock(LockApplied::Acquired { lock_id, requester, mode })) => json!({
                "status": "acquired",
                "lock_id": lock_id,
                "holder_id": requester,
                "lock_type": mode,
            }),
            Ok(Applied::Lock(LockApplied::Waiting { lock_id, requester, position })) => json!({
                "status": "waiting",
                "lock_id": lock_id,
                "requester_id": requester,
                "queue_position": position,
            }),
            Ok(Applied::Lock(LockApplied::Deadlock { lock_id, .. })) => json!({
                "status": "error",
                "message": "Deadlock detected",
                "lock_id": lock_id,
            }),
            Ok(_) => json!({"status": "error", "message": "Unexpected outcome"}),
            Err(e) => self.error_reply(e),
        }
    }

    async fn release_lock(&self, lock_id: String, holder: String) -> Value {
        let command = Command::Lock(LockCommand::Release { lock_id, holder });
        match self.propose_and_wait(command).await {
            Ok(Applied::Lock(LockApplied::Released { lock_id, holder, .. })) => json!({
                "status": "released",
                "lock_id": lock_id,
                "holder_id": holder,
            }),
            Ok(Applied::Lock(LockApplied::NotFound { lock_id })) => json!({
                "status": "error",
                "message": "Lock not found",
                "lock_id": lock_id,
            }),
            Ok(Applied::Lock(LockApplied::NotHolder { lock_id, .. })) => json!({
                "status": "error",
                "message": "Not a lock holder",
                "lock_id": lock_id,
            }),
            Ok(_) => json!({"status": "error", "message": "Unexpected outcome"}),
            Err(e) => self.error_reply(e),
        }
    }

    fn lock_status(&self, lock_id: Option<String>) -> Value {
        let locks = self.state.locks.lock().unwrap();
        match lock_id {
            Some(id) => match locks.status(&id) {
                Some(status) => lock_status_json(&status, "found"),
                None => json!({"status": "not_found", "lock_id": id}),
            },
            None => {
                let all: Vec<Value> = locks
                    .all_status()
                    .iter()
                    .map(|s| lock_status_json(s, "found"))
                    .collect();
                json!({"locks": all})
            }
        }
    }

    async fn node_info(&self) -> Value {
        let status = self.raft.status().await;
        json!({
            "node_id": self.config.node_id,
            "state": status.role,
            "term": status.term,
            "leader_id": status.leader.and_then(|id| self.cluster.name_of(id)),
            "log_size": status.last_index,
            "commit_index": status.commit_index,
            "last_applied": status.last_applied,
            "cluster_size": self.cluster.len(),
        })
    }

    // --- Queue service ---

    async fn handle_queue(&self, request: Value) -> Value {
        let request: QueueRequest = match serde_json::from_value(request) {
            Ok(r) => r,
            Err(_) => return json!({"status": "error", "message": "Unknown action"}),
        };
        match request {
            QueueRequest::Create { queue_name } => self.create_queue(queue_name).await,
            QueueRequest::Enqueue { queue_name, message_data, priority } => {
                self.enqueue(queue_name, message_data, priority).await
            }
            QueueRequest::Dequeue { queue_name, consumer_id } => {
                self.dequeue(queue_name, consumer_id).await
            }
            QueueRequest::Ack { message_id, consumer_id } => {
                self.ack(message_id, consumer_id).await
            }
            QueueRequest::Nack { message_id, queue_name } => {
                self.nack(message_id, queue_name).await
            }
            QueueRequest::Stats { queue_name } => self.queue_stats(&queue_name),
        }
    }

    async fn create_queue(&self, queue: String) -> Value {
        match self.propose_and_wait(Command::Queue(QueueCommand::Create { queue })).await {
            Ok(Applied::Queue(QueueApplied::Created { queue })) => json!({
                "status": "success",
                "message": "Queue created",
                "queue_name": queue,
            }),
            Ok(Applied::Queue(QueueApplied::AlreadyExists { queue })) => json!({
                "status": "error",
                "message": "Queue already exists",
                "queue_name": queue,
            }),
            Ok(_) => json!({"status": "error", "message": "Unexpected outcome"}),
            Err(e) => self.error_reply(e),
        }
    }

    async fn enqueue(&self, queue: String, data: Value, priority: i64) -> Value {
        let message_id = format!(
            "{}:{}:{}",
            self.config.node_id,
            now_ms(),
            self.enqueue_counter.fetch_add(1, Ordering::Relaxed),
        );
        let command = Command::Queue(QueueCommand::Enqueue {
            queue,
            message_id,
            data,
            priority,
        });
        match self.propose_and_wait(command).await {
            Ok(Applied::Queue(QueueApplied::Enqueued { queue, message_id })) => {
                let replicas = self.replicate_message(&queue, &message_id);
                json!({
                    "status": "success",
                    "message_id": message_id,
                    "queue_name": queue,
                    "replicas": replicas,
                })
            }
            Ok(_) => json!({"status": "error", "message": "Unexpected outcome"}),
            Err(e) => self.error_reply(e),
        }
    }

    /// Ring-selected replica set for a freshly enqueued message. Copies go
    /// out as fire-and-forget tasks; receipt is idempotent.
    fn replicate_message(&self, queue: &str, message_id: &str) -> Vec<String> {
        let factor = self.config.queue_replication_factor;
        let replicas = self.ring.lock().unwrap().replicas(message_id, factor);
        let Some(message) = self.state.queues.lock().unwrap().message(message_id).cloned()
        else {
            return replicas;
        };

        for name in &replicas {
            let Some(peer) = self.cluster.id_of(name) else { continue };
            if peer == self.cluster.self_id() {
                continue;
            }
            let sync = QueueSync::Replicate {
                queue: queue.to_string(),
                message: message.clone(),
            };
            let Ok(payload) = serde_json::to_vec(&sync) else { continue };
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.send(peer, MessageKind::Queue, payload, true).await {
                    warn!("[Queue] Replication to peer {} failed: {:#}", peer, e);
                }
            });
        }
        replicas
    }

    async fn dequeue(&self, queue: String, consumer: String) -> Value {
        let command = Command::Queue(QueueCommand::Dequeue { queue, consumer });
        match self.propose_and_wait(command).await {
            Ok(Applied::Queue(QueueApplied::Dequeued { queue, consumer, message })) => json!({
                "status": "success",
                "queue_name": queue,
                "consumer_id": consumer,
                "message": *message,
            }),
            Ok(Applied::Queue(QueueApplied::Empty { queue })) => json!({
                "status": "empty",
                "message": "Queue is empty",
                "queue_name": queue,
            }),
            Ok(Applied::Queue(QueueApplied::QueueNotFound { queue })) => json!({
                "status": "error",
                "message": "Queue not found",
                "queue_name": queue,
            }),
            Ok(_) => json!({"status": "error", "message": "Unexpected outcome"}),
            Err(e) => self.error_reply(e),
        }
    }

    async fn ack(&self, message_id: String, consumer: String) -> Value {
        let command = Command::Queue(QueueCommand::Ack { message_id, consumer });
        match self.propose_and_wait(command).await {
            Ok(Applied::Queue(QueueApplied::Acked { message_id })) => json!({
                "status": "success",
                "message_id": message_id,
            }),
            Ok(Applied::Queue(QueueApplied::AckRejected { message_id, .. })) => json!({
                "status": "error",
                "message": "Not the message owner",
                "message_id": message_id,
            }),
            Ok(Applied::Queue(QueueApplied::MessageNotFound { message_id })) => json!({
                "status": "error",
                "message": "Message not found",
                "message_id": message_id,
            }),
            Ok(_) => json!({"status": "error", "message": "Unexpected outcome"}),
            Err(e) => self.error_reply(e),
        }
    }

    async fn nack(&self, message_id: String, queue: String) -> Value {
        let command = Command::Queue(QueueCommand::Nack { message_id, queue: queue.clone() });
        match self.propose_and_wait(command).await {
            Ok(Applied::Queue(QueueApplied::Nacked { message_id, attempts, requeued: true })) => {
                json!({
                    "status": "requeued",
                    "message_id": message_id,
                    "queue_name": queue,
                    "attempts": attempts,
                })
            }
            Ok(Applied::Queue(QueueApplied::Nacked { message_id, requeued: false, .. })) => {
                json!({
                    "status": "failed",
                    "message_id": message_id,
                    "reason": "Max attempts reached",
                })
            }
            Ok(Applied::Queue(QueueApplied::MessageNotFound { message_id })) => json!({
                "status": "error",
                "message": "Message not found",
                "message_id": message_id,
            }),
            Ok(_) => json!({"status": "error", "message": "Unexpected outcome"}),
            Err(e) => self.error_reply(e),
        }
    }

    fn queue_stats(&self, queue: &str) -> Value {
        match self.state.queues.lock().unwrap().stats(queue) {
            Some(stats) => json!({
                "status": "success",
                "queue_name": stats.queue_name,
                "size": stats.size,
                "pending": stats.pending,
                "consumers": stats.consumers,
            }),
            None => json!({
                "status": "error",
                "message": "Queue not found",
                "queue_name": queue,
            }),
        }
    }

    // --- Cache service ---

    async fn handle_cache(&self, request: Value) -> Value {
        let request: CacheRequest = match serde_json::from_value(request) {
            Ok(r) => r,
            Err(_) => return json!({"status": "error", "message": "Unknown action"}),
        };
        match request {
            CacheRequest::Get { key, requester_id } => {
                let requester = requester_id.unwrap_or_else(|| "unknown".to_string());
                match self.cache.get(&key, &requester).await {
                    Ok(GetResult::Hit { value, state, version }) => json!({
                        "status": "hit",
                        "key": key,
                        "value": value,
                        "state": state,
                        "version": version,
                    }),
                    Ok(GetResult::Miss) => json!({
                        "status": "miss",
                        "key": key,
                        "message": "Key not found in cache",
                    }),
                    Err(e) => json!({"status": "error", "message": format!("{:#}", e)}),
                }
            }
            CacheRequest::Put { key, value, requester_id } => {
                let requester = requester_id.unwrap_or_else(|| "unknown".to_string());
                match self.cache.put(&key, value, &requester).await {
                    Ok(put) => json!({
                        "status": "success",
                        "key": key,
                        "state": put.state,
                        "version": put.version,
                    }),
                    Err(e) => json!({"status": "error", "message": format!("{:#}", e)}),
                }
            }
            CacheRequest::Invalidate { key } => {
                if self.cache.invalidate_local(&key, None).await {
                    json!({"status": "invalidated", "key": key})
                } else {
                    json!({"status": "not_found", "key": key})
                }
            }
            CacheRequest::Delete { key } => match self.cache.delete(&key).await {
                Ok(true) => json!({"status": "deleted", "key": key}),
                Ok(false) => json!({"status": "not_found", "key": key}),
                Err(e) => json!({"status": "error", "message": format!("{:#}", e)}),
            },
            CacheRequest::Stats => {
                let stats = self.cache.stats().await;
                json!({
                    "node_id": self.config.node_id,
                    "policy": stats.policy,
                    "capacity": stats.capacity,
                    "size": stats.size,
                    "hits": stats.hits,
                    "misses": stats.misses,
                    "hit_rate": format!("{:.2}%", stats.hit_rate),
                    "invalidations": stats.invalidations,
                    "total_requests": stats.hits + stats.misses,
                })
            }
            CacheRequest::State => {
                let entries: Vec<Value> = self
                    .cache
                    .entries()
                    .await
                    .into_iter()
                    .map(|(key, entry)| {
                        json!({
                            "key": key,
                            "value": entry.value,
                            "state": entry.state,
                            "version": entry.version,
                            "access_count": entry.access_count,
                            "created_at": entry.created_at_ms,
                            "last_accessed": entry.last_accessed_ms,
                        })
                    })
                    .collect();
                json!({"entries": entries})
            }
        }
    }
}

fn lock_status_json(status: &LockStatus, tag: &str) -> Value {
    json!({
        "status": tag,
        "lock_id": status.lock_id,
        "lock_type": status.mode,
        "holders": status.holders,
        "waiting_count": status.waiting_count,
        "created_at": status.created_at_ms,
        "last_accessed": status.last_touched_ms,
    })
}
