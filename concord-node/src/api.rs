// SPDX-License-Identifier: MIT

use concord_lock::LockMode;
use serde::Deserialize;
use serde_json::Value;

fn default_lock_timeout() -> f64 {
    concord_lock::DEFAULT_LOCK_TIMEOUT_SECS as f64
}

/// Lock service requests, one JSON document per connection, dispatched on
/// the `action` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum LockRequest {
    Acquire {
        lock_id: String,
        requester_id: String,
        lock_type: LockMode,
        #[serde(default = "default_lock_timeout")]
        timeout: f64,
    },
    Release {
        lock_id: String,
        holder_id: String,
    },
    Status {
        #[serde(default)]
        lock_id: Option<String>,
    },
    /// Node-level view: role, term, leader, log progress.
    Info,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum QueueRequest {
    Create {
        queue_name: String,
    },
    Enqueue {
        queue_name: String,
        message_data: Value,
        #[serde(default)]
        priority: i64,
    },
    Dequeue {
        queue_name: String,
        consumer_id: String,
    },
    Ack {
        message_id: String,
        consumer_id: String,
    },
    Nack {
        message_id: String,
        queue_name: String,
    },
    Stats {
        queue_name: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum CacheRequest {
    Get {
        key: String,
        #[serde(default)]
        requester_id: Option<String>,
    },
    Put {
        key: String,
        value: Value,
        #[serde(default)]
        requester_id: Option<String>,
    },
    Invalidate {
        key: String,
    },
    Delete {
        key: String,
    },
    Stats,
    State,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_acquire_with_default_timeout() {
        let request: LockRequest = serde_json::from_value(json!({
            "action": "acquire",
            "lock_id": "k",
            "requester_id": "c1",
            "lock_type": "exclusive",
        }))
        .unwrap();
        match request {
            LockRequest::Acquire { lock_type, timeout, .. } => {
                assert_eq!(lock_type, LockMode::Exclusive);
                assert_eq!(timeout, 30.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_action() {
        let request = serde_json::from_value::<QueueRequest>(json!({
            "action": "flush",
            "queue_name": "q",
        }));
        assert!(request.is_err());
    }

    #[test]
    fn parses_cache_state_action() {
        let request: CacheRequest = serde_json::from_value(json!({"action": "state"})).unwrap();
        assert!(matches!(request, CacheRequest::State));
    }
}
