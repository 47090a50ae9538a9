// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet, VecDeque};

use concord_core::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message_id: String,
    pub queue: String,
    pub data: Value,
    pub priority: i64,
    pub status: MessageStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at_ms: u64,
    /// Set while `Processing`; cleared on ack/nack/requeue.
    pub leased_at_ms: Option<u64>,
    pub delivered_to: HashSet<String>,
}

/// Replicated queue mutations, applied in Raft log order on every replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueCommand {
    Create {
        queue: String,
    },
    /// The origin node allocates the message id before proposing so every
    /// replica stores the same identity.
    Enqueue {
        queue: String,
        message_id: String,
        data: Value,
        priority: i64,
    },
    Dequeue {
        queue: String,
        consumer: String,
    },
    Ack {
        message_id: String,
        consumer: String,
    },
    Nack {
        message_id: String,
        queue: String,
    },
    /// Synthesized by the leader's lease sweep with the ids it saw expire,
    /// so the requeue decision itself is deterministic.
    ExpireLeases {
        message_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueApplied {
    Created { queue: String },
    AlreadyExists { queue: String },
    Enqueued { queue: String, message_id: String },
    Dequeued { queue: String, consumer: String, message: Box<QueuedMessage> },
    Empty { queue: String },
    QueueNotFound { queue: String },
    Acked { message_id: String },
    AckRejected { message_id: String, consumer: String },
    Nacked { message_id: String, attempts: u32, requeued: bool },
    MessageNotFound { message_id: String },
    LeasesReleased { count: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub size: usize,
    pub pending: usize,
    pub consumers: usize,
}

/// The queue manager's state machine: named queues of message ids ordered
/// by priority (descending) with FIFO order inside a priority, plus the
/// backing message records. Single-writer via the Raft apply path;
/// `replicate_in` is the idempotent transport-side entry used by ring
/// replication.
#[derive(Default)]
pub struct QueueTable {
    queues: HashMap<String, VecDeque<String>>,
    messages: HashMap<String, QueuedMessage>,
    consumers: HashMap<String, HashSet<String>>,
}

impl QueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, command: QueueCommand) -> QueueApplied {
        match command {
            QueueCommand::Create { queue } => self.create(queue),
            QueueCommand::Enqueue { queue, message_id, data, priority } => {
                self.enqueue(queue, message_id, data, priority)
            }
            QueueCommand::Dequeue { queue, consumer } => self.dequeue(queue, consumer),
            QueueCommand::Ack { message_id, consumer } => self.ack(message_id, consumer),
            QueueCommand::Nack { message_id, queue } => self.nack(message_id, queue),
            QueueCommand::ExpireLeases { message_ids } => self.expire_leases(message_ids),
        }
    }

    fn create(&mut self, queue: String) -> QueueApplied {
        if self.queues.contains_key(&queue) {
            return QueueApplied::AlreadyExists { queue };
        }
        self.queues.insert(queue.clone(), VecDeque::new());
        self.consumers.insert(queue.clone(), HashSet::new());
        info!("[Queue] Created queue {}", queue);
        QueueApplied::Created { queue }
    }

    fn enqueue(&mut self, queue: String, message_id: String, data: Value, priority: i64) -> QueueApplied {
        if !self.queues.contains_key(&queue) {
            self.create(queue.clone());
        }
        let message = QueuedMessage {
            message_id: message_id.clone(),
            queue: queue.clone(),
            data,
            priority,
            status: MessageStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at_ms: now_ms(),
            leased_at_ms: None,
            delivered_to: HashSet::new(),
        };
        self.messages.insert(message_id.clone(), message);
        self.insert_by_priority(&queue, &message_id, priority);
        info!("[Queue] Message {} enqueued to {} (priority {})", message_id, queue, priority);
        QueueApplied::Enqueued { queue, message_id }
    }

    /// First position whose message has a strictly lower priority; ties
    /// stay behind earlier arrivals, which is what keeps FIFO inside one
    /// priority.
    fn insert_by_priority(&mut self, queue: &str, message_id: &str, priority: i64) {
        let ids = self.queues.get_mut(queue).unwrap();
        let position = ids.iter().position(|existing| {
            self.messages
                .get(existing)
                .map(|m| priority > m.priority)
                .unwrap_or(false)
        });
        match position {
            Some(i) => ids.insert(i, message_id.to_string()),
            None => ids.push_back(message_id.to_string()),
        }
    }

    fn dequeue(&mut self, queue: String, consumer: String) -> QueueApplied {
        let Some(ids) = self.queues.get_mut(&queue) else {
            return QueueApplied::QueueNotFound { queue };
        };

        // Skip ids whose record vanished (spurious entries after a crash).
        let message_id = loop {
            match ids.pop_front() {
                Some(id) if self.messages.contains_key(&id) => break id,
                Some(id) => {
                    debug!("[Queue] Dropping orphaned entry {}", id);
                }
                None => return QueueApplied::Empty { queue },
            }
        };

        let message = self.messages.get_mut(&message_id).unwrap();
        message.status = MessageStatus::Processing;
        message.attempts += 1;
        message.leased_at_ms = Some(now_ms());
        message.delivered_to.insert(consumer.clone());
        let snapshot = message.clone();

        self.consumers.entry(queue.clone()).or_default().insert(consumer.clone());
        info!("[Queue] Message {} dequeued by {}", message_id, consumer);
        QueueApplied::Dequeued { queue, consumer, message: Box::new(snapshot) }
    }

    fn ack(&mut self, message_id: String, consumer: String) -> QueueApplied {
        let Some(message) = self.messages.get_mut(&message_id) else {
            return QueueApplied::MessageNotFound { message_id };
        };
        if !message.delivered_to.contains(&consumer) {
            warn!("[Queue] Ack for {} from non-owner {}", message_id, consumer);
            return QueueApplied::AckRejected { message_id, consumer };
        }
        message.status = MessageStatus::Delivered;
        message.leased_at_ms = None;
        info!("[Queue] Message {} acknowledged by {}", message_id, consumer);
        QueueApplied::Acked { message_id }
    }

    fn nack(&mut self, message_id: String, queue: String) -> QueueApplied {
        let Some(message) = self.messages.get_mut(&message_id) else {
            return QueueApplied::MessageNotFound { message_id };
        };
        if message.attempts >= message.max_attempts {
            message.status = MessageStatus::Failed;
            message.leased_at_ms = None;
            warn!("[Queue] Message {} failed after {} attempts", message_id, message.attempts);
            return QueueApplied::Nacked {
                message_id,
                attempts: message.attempts,
                requeued: false,
            };
        }
        message.status = MessageStatus::Pending;
        message.leased_at_ms = None;
        let (attempts, priority) = (message.attempts, message.priority);
        self.insert_by_priority(&queue, &message_id, priority);
        info!("[Queue] Message {} requeued to {} (attempt {})", message_id, queue, attempts);
        QueueApplied::Nacked { message_id, attempts, requeued: true }
    }

    fn expire_leases(&mut self, message_ids: Vec<String>) -> QueueApplied {
        let mut count = 0;
        for message_id in message_ids {
            let Some(message) = self.messages.get_mut(&message_id) else {
                continue;
            };
            if message.status != MessageStatus::Processing {
                continue;
            }
            message.status = MessageStatus::Pending;
            message.leased_at_ms = None;
            let (queue, priority) = (message.queue.clone(), message.priority);
            self.insert_by_priority(&queue, &message_id, priority);
            warn!("[Queue] Lease expired, {} returned to {}", message_id, queue);
            count += 1;
        }
        QueueApplied::LeasesReleased { count }
    }

    /// Ids of `Processing` messages whose lease is older than the
    /// threshold. The sweep proposes these as an `ExpireLeases` command.
    pub fn expired_leases(&self, lease_timeout_ms: u64) -> Vec<String> {
        let now = now_ms();
        let mut ids: Vec<String> = self
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Processing)
            .filter(|m| {
                m.leased_at_ms
                    .map(|t| now.saturating_sub(t) > lease_timeout_ms)
                    .unwrap_or(false)
            })
            .map(|m| m.message_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Idempotent replica-side insert, fed by ring replication over the
    /// transport. Returns false when the message was already known.
    pub fn replicate_in(&mut self, queue: &str, message: QueuedMessage) -> bool {
        if self.messages.contains_key(&message.message_id) {
            debug!("[Queue] Duplicate replica of {}", message.message_id);
            return false;
        }
        if !self.queues.contains_key(queue) {
            self.create(queue.to_string());
        }
        let (id, priority) = (message.message_id.clone(), message.priority);
        self.messages.insert(id.clone(), message);
        if self.messages[&id].status == MessageStatus::Pending {
            self.insert_by_priority(queue, &id, priority);
        }
        true
    }

    pub fn message(&self, message_id: &str) -> Option<&QueuedMessage> {
        self.messages.get(message_id)
    }

    pub fn stats(&self, queue: &str) -> Option<QueueStats> {
        let ids = self.queues.get(queue)?;
        let pending = ids
            .iter()
            .filter(|id| {
                self.messages
                    .get(*id)
                    .map(|m| m.status == MessageStatus::Pending)
                    .unwrap_or(false)
            })
            .count();
        Some(QueueStats {
            queue_name: queue.to_string(),
            size: ids.len(),
            pending,
            consumers: self.consumers.get(queue).map(|c| c.len()).unwrap_or(0),
        })
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enqueue(table: &mut QueueTable, queue: &str, id: &str, data: Value, priority: i64) {
        let applied = table.apply(QueueCommand::Enqueue {
            queue: queue.to_string(),
            message_id: id.to_string(),
            data,
            priority,
        });
        assert!(matches!(applied, QueueApplied::Enqueued { .. }));
    }

    fn dequeue(table: &mut QueueTable, queue: &str, consumer: &str) -> QueueApplied {
        table.apply(QueueCommand::Dequeue {
            queue: queue.to_string(),
            consumer: consumer.to_string(),
        })
    }

    #[test]
    fn delivers_by_priority_then_fifo() {
        let mut table = QueueTable::new();
        enqueue(&mut table, "q", "m1", json!({"msg": "low"}), 1);
        enqueue(&mut table, "q", "m2", json!({"msg": "high"}), 5);
        enqueue(&mut table, "q", "m3", json!({"msg": "medium"}), 3);

        for expected in ["high", "medium", "low"] {
            match dequeue(&mut table, "q", "c1") {
                QueueApplied::Dequeued { message, .. } => {
                    assert_eq!(message.data["msg"], expected);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(dequeue(&mut table, "q", "c1"), QueueApplied::Empty { .. }));
    }

    #[test]
    fn same_priority_is_fifo() {
        let mut table = QueueTable::new();
        for id in ["a", "b", "c"] {
            enqueue(&mut table, "q", id, json!({"id": id}), 2);
        }
        for expected in ["a", "b", "c"] {
            match dequeue(&mut table, "q", "c1") {
                QueueApplied::Dequeued { message, .. } => {
                    assert_eq!(message.message_id, expected);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn duplicate_create_conflicts() {
        let mut table = QueueTable::new();
        assert!(matches!(
            table.apply(QueueCommand::Create { queue: "q".into() }),
            QueueApplied::Created { .. }
        ));
        assert!(matches!(
            table.apply(QueueCommand::Create { queue: "q".into() }),
            QueueApplied::AlreadyExists { .. }
        ));
    }

    #[test]
    fn dequeue_from_unknown_queue_is_an_error() {
        let mut table = QueueTable::new();
        assert!(matches!(
            dequeue(&mut table, "nope", "c1"),
            QueueApplied::QueueNotFound { .. }
        ));
    }

    #[test]
    fn nack_requeues_until_attempts_run_out() {
        let mut table = QueueTable::new();
        enqueue(&mut table, "q", "m1", json!({"task": "x"}), 0);

        for round in 1..=DEFAULT_MAX_ATTEMPTS {
            match dequeue(&mut table, "q", "c1") {
                QueueApplied::Dequeued { message, .. } => {
                    assert_eq!(message.attempts, round);
                    assert_eq!(message.status, MessageStatus::Processing);
                }
                other => panic!("unexpected {:?}", other),
            }
            let nacked = table.apply(QueueCommand::Nack {
                message_id: "m1".into(),
                queue: "q".into(),
            });
            match nacked {
                QueueApplied::Nacked { attempts, requeued, .. } => {
                    assert_eq!(attempts, round);
                    assert_eq!(requeued, round < DEFAULT_MAX_ATTEMPTS);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        // Dead-lettered: no further delivery, attempts never exceed the cap.
        assert!(matches!(dequeue(&mut table, "q", "c1"), QueueApplied::Empty { .. }));
        let message = table.message("m1").unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn ack_finishes_delivery() {
        let mut table = QueueTable::new();
        enqueue(&mut table, "q", "m1", json!({"n": 1}), 0);
        let QueueApplied::Dequeued { .. } = dequeue(&mut table, "q", "c1") else {
            panic!("expected a message");
        };
        assert!(matches!(
            table.apply(QueueCommand::Ack { message_id: "m1".into(), consumer: "c1".into() }),
            QueueApplied::Acked { .. }
        ));
        assert_eq!(table.message("m1").unwrap().status, MessageStatus::Delivered);
        assert_eq!(table.stats("q").unwrap().size, 0);
    }

    #[test]
    fn ack_from_non_owner_is_rejected() {
        let mut table = QueueTable::new();
        enqueue(&mut table, "q", "m1", json!({}), 0);
        let _ = dequeue(&mut table, "q", "c1");
        assert!(matches!(
            table.apply(QueueCommand::Ack { message_id: "m1".into(), consumer: "imposter".into() }),
            QueueApplied::AckRejected { .. }
        ));
        assert_eq!(table.message("m1").unwrap().status, MessageStatus::Processing);
    }

    #[test]
    fn expired_lease_returns_message_to_pending() {
        let mut table = QueueTable::new();
        enqueue(&mut table, "q", "m1", json!({"job": 1}), 0);
        let _ = dequeue(&mut table, "q", "c1");

        // Zero threshold: the lease is already stale.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let expired = table.expired_leases(0);
        assert_eq!(expired, vec!["m1".to_string()]);

        match table.apply(QueueCommand::ExpireLeases { message_ids: expired }) {
            QueueApplied::LeasesReleased { count } => assert_eq!(count, 1),
            other => panic!("unexpected {:?}", other),
        }

        match dequeue(&mut table, "q", "c2") {
            QueueApplied::Dequeued { message, .. } => {
                assert_eq!(message.attempts, 2);
                assert!(message.delivered_to.contains("c1"));
                assert!(message.delivered_to.contains("c2"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn dequeue_skips_orphaned_ids() {
        let mut table = QueueTable::new();
        enqueue(&mut table, "q", "gone", json!({}), 5);
        enqueue(&mut table, "q", "kept", json!({}), 1);
        table.messages.remove("gone");

        match dequeue(&mut table, "q", "c1") {
            QueueApplied::Dequeued { message, .. } => assert_eq!(message.message_id, "kept"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn replicate_in_is_idempotent() {
        let mut table = QueueTable::new();
        let message = QueuedMessage {
            message_id: "n1:1:0".into(),
            queue: "q".into(),
            data: json!({"r": true}),
            priority: 2,
            status: MessageStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at_ms: now_ms(),
            leased_at_ms: None,
            delivered_to: HashSet::new(),
        };
        assert!(table.replicate_in("q", message.clone()));
        assert!(!table.replicate_in("q", message));
        assert_eq!(table.stats("q").unwrap().size, 1);
    }
}
