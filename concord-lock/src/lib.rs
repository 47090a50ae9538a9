// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet, VecDeque};

use concord_core::now_ms;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Replicated lock mutations. These arrive through the Raft apply path,
/// so every decision below must depend only on the table state and the
/// command itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LockCommand {
    Acquire {
        lock_id: String,
        requester: String,
        mode: LockMode,
        timeout_secs: u64,
    },
    Release {
        lock_id: String,
        holder: String,
    },
    /// Synthesized by the leader's expiry sweep; identical to Release but
    /// surfaced to observers as a timeout.
    Expire {
        lock_id: String,
        holder: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockApplied {
    Acquired {
        lock_id: String,
        requester: String,
        mode: LockMode,
    },
    Waiting {
        lock_id: String,
        requester: String,
        position: usize,
    },
    Deadlock {
        lock_id: String,
        requester: String,
    },
    Released {
        lock_id: String,
        holder: String,
        /// Waiters admitted by this release, in grant order.
        granted: Vec<(String, LockMode)>,
        timed_out: bool,
    },
    NotFound {
        lock_id: String,
    },
    NotHolder {
        lock_id: String,
        holder: String,
    },
}

#[derive(Debug, Clone)]
struct Waiter {
    requester: String,
    mode: LockMode,
    #[allow(dead_code)]
    enqueued_at_ms: u64,
}

#[derive(Debug)]
struct LockState {
    mode: LockMode,
    holders: HashSet<String>,
    waiters: VecDeque<Waiter>,
    created_at_ms: u64,
    last_touched_ms: u64,
    timeout_secs: u64,
}

impl LockState {
    fn can_acquire(&self, mode: LockMode) -> bool {
        self.holders.is_empty() || (mode == LockMode::Shared && self.mode == LockMode::Shared)
    }

    fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_touched_ms) > self.timeout_secs * 1000
    }
}

/// Read-only view of one lock, for status RPCs.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub lock_id: String,
    pub mode: LockMode,
    pub holders: Vec<String>,
    pub waiting_count: usize,
    pub created_at_ms: u64,
    pub last_touched_ms: u64,
}

/// The lock manager's state machine. Single-writer: mutations come in as
/// committed `LockCommand`s from the Raft apply path; reads may be served
/// from any replica and can trail the leader.
#[derive(Default)]
pub struct LockTable {
    locks: HashMap<String, LockState>,
    /// requester -> holders it waits on. Rebuilt whenever holders or
    /// waiters change.
    wait_for: HashMap<String, HashSet<String>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, command: LockCommand) -> LockApplied {
        match command {
            LockCommand::Acquire { lock_id, requester, mode, timeout_secs } => {
                self.acquire(lock_id, requester, mode, timeout_secs)
            }
            LockCommand::Release { lock_id, holder } => self.release(lock_id, holder, false),
            LockCommand::Expire { lock_id, holder } => self.release(lock_id, holder, true),
        }
    }

    fn acquire(
        &mut self,
        lock_id: String,
        requester: String,
        mode: LockMode,
        timeout_secs: u64,
    ) -> LockApplied {
        let now = now_ms();

        let Some(lock) = self.locks.get_mut(&lock_id) else {
            self.locks.insert(lock_id.clone(), LockState {
                mode,
                holders: HashSet::from([requester.clone()]),
                waiters: VecDeque::new(),
                created_at_ms: now,
                last_touched_ms: now,
                timeout_secs,
            });
            info!("[Lock] {} acquired by {} ({:?})", lock_id, requester, mode);
            return LockApplied::Acquired { lock_id, requester, mode };
        };

        if lock.can_acquire(mode) {
            lock.holders.insert(requester.clone());
            lock.mode = mode;
            lock.last_touched_ms = now;
            info!("[Lock] {} acquired by {} ({:?})", lock_id, requester, mode);
            return LockApplied::Acquired { lock_id, requester, mode };
        }

        // Refuse rather than enqueue if waiting would close a cycle.
        if self.would_deadlock(&requester, &lock_id) {
            warn!("[Lock] Deadlock: {} requesting {}", requester, lock_id);
            return LockApplied::Deadlock { lock_id, requester };
        }

        let lock = self.locks.get_mut(&lock_id).unwrap();
        lock.waiters.push_back(Waiter {
            requester: requester.clone(),
            mode,
            enqueued_at_ms: now,
        });
        let position = lock.waiters.len();
        self.rebuild_wait_graph();
        info!("[Lock] {} waiting for {} (position {})", requester, lock_id, position);
        LockApplied::Waiting { lock_id, requester, position }
    }

    fn release(&mut self, lock_id: String, holder: String, timed_out: bool) -> LockApplied {
        let Some(lock) = self.locks.get_mut(&lock_id) else {
            return LockApplied::NotFound { lock_id };
        };
        if !lock.holders.remove(&holder) {
            return LockApplied::NotHolder { lock_id, holder };
        }
        lock.last_touched_ms = now_ms();

        // Admit the head; a shared head pulls every consecutive shared
        // waiter in with it.
        let mut granted = Vec::new();
        if lock.holders.is_empty() {
            while let Some(head) = lock.waiters.front() {
                if !granted.is_empty() && head.mode == LockMode::Exclusive {
                    break;
                }
                let head = lock.waiters.pop_front().unwrap();
                lock.mode = head.mode;
                lock.holders.insert(head.requester.clone());
                let exclusive = head.mode == LockMode::Exclusive;
                granted.push((head.requester, head.mode));
                if exclusive {
                    break;
                }
            }
        }

        if lock.holders.is_empty() && lock.waiters.is_empty() {
            self.locks.remove(&lock_id);
            debug!("[Lock] {} destroyed", lock_id);
        }
        self.rebuild_wait_graph();

        for (requester, mode) in &granted {
            info!("[Lock] {} granted to {} ({:?}) from queue", lock_id, requester, mode);
        }
        info!("[Lock] {} released by {}{}", lock_id, holder, if timed_out { " (timeout)" } else { "" });
        LockApplied::Released { lock_id, holder, granted, timed_out }
    }

    /// Would adding edges `requester -> h` for every current holder of
    /// `lock_id` close a cycle? Checked on a copy; the table itself is
    /// untouched.
    fn would_deadlock(&self, requester: &str, lock_id: &str) -> bool {
        let Some(lock) = self.locks.get(lock_id) else {
            return false;
        };

        let mut graph: HashMap<String, HashSet<String>> = self.wait_for.clone();
        graph
            .entry(requester.to_string())
            .or_default()
            .extend(lock.holders.iter().cloned());

        fn has_cycle(
            graph: &HashMap<String, HashSet<String>>,
            node: &str,
            visited: &mut HashSet<String>,
            stack: &mut HashSet<String>,
        ) -> bool {
            visited.insert(node.to_string());
            stack.insert(node.to_string());
            if let Some(neighbors) = graph.get(node) {
                for next in neighbors {
                    if !visited.contains(next) {
                        if has_cycle(graph, next, visited, stack) {
                            return true;
                        }
                    } else if stack.contains(next) {
                        return true;
                    }
                }
            }
            stack.remove(node);
            false
        }

        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        has_cycle(&graph, requester, &mut visited, &mut stack)
    }

    /// Derive the whole wait-for graph from the current holders/waiters.
    fn rebuild_wait_graph(&mut self) {
        self.wait_for.clear();
        for lock in self.locks.values() {
            for waiter in &lock.waiters {
                self.wait_for
                    .entry(waiter.requester.clone())
                    .or_default()
                    .extend(lock.holders.iter().cloned());
            }
        }
    }

    pub fn status(&self, lock_id: &str) -> Option<LockStatus> {
        self.locks.get(lock_id).map(|lock| {
            let mut holders: Vec<String> = lock.holders.iter().cloned().collect();
            holders.sort();
            LockStatus {
                lock_id: lock_id.to_string(),
                mode: lock.mode,
                holders,
                waiting_count: lock.waiters.len(),
                created_at_ms: lock.created_at_ms,
                last_touched_ms: lock.last_touched_ms,
            }
        })
    }

    pub fn all_status(&self) -> Vec<LockStatus> {
        let mut ids: Vec<&String> = self.locks.keys().collect();
        ids.sort();
        ids.iter().filter_map(|id| self.status(id)).collect()
    }

    /// `(lock_id, holder)` pairs whose locks have outlived their timeout.
    /// The expiry sweep turns these into `Expire` commands.
    pub fn expired_holders(&self) -> Vec<(String, String)> {
        let now = now_ms();
        let mut expired = Vec::new();
        for (id, lock) in &self.locks {
            if lock.is_expired(now) {
                for holder in &lock.holders {
                    expired.push((id.clone(), holder.clone()));
                }
            }
        }
        expired.sort();
        expired
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire(table: &mut LockTable, lock: &str, who: &str, mode: LockMode) -> LockApplied {
        table.apply(LockCommand::Acquire {
            lock_id: lock.to_string(),
            requester: who.to_string(),
            mode,
            timeout_secs: 30,
        })
    }

    fn release(table: &mut LockTable, lock: &str, who: &str) -> LockApplied {
        table.apply(LockCommand::Release {
            lock_id: lock.to_string(),
            holder: who.to_string(),
        })
    }

    #[test]
    fn exclusive_contention_waits_then_hands_over() {
        let mut table = LockTable::new();

        assert!(matches!(
            acquire(&mut table, "k", "c1", LockMode::Exclusive),
            LockApplied::Acquired { .. }
        ));
        match acquire(&mut table, "k", "c2", LockMode::Exclusive) {
            LockApplied::Waiting { position, .. } => assert_eq!(position, 1),
            other => panic!("unexpected {:?}", other),
        }

        match release(&mut table, "k", "c1") {
            LockApplied::Released { granted, .. } => {
                assert_eq!(granted, vec![("c2".to_string(), LockMode::Exclusive)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(table.status("k").unwrap().holders, vec!["c2"]);
    }

    #[test]
    fn shared_holders_coexist_but_exclusive_waits() {
        let mut table = LockTable::new();
        assert!(matches!(
            acquire(&mut table, "k", "r1", LockMode::Shared),
            LockApplied::Acquired { .. }
        ));
        assert!(matches!(
            acquire(&mut table, "k", "r2", LockMode::Shared),
            LockApplied::Acquired { .. }
        ));
        assert_eq!(table.status("k").unwrap().holders.len(), 2);

        assert!(matches!(
            acquire(&mut table, "k", "w", LockMode::Exclusive),
            LockApplied::Waiting { position: 1, .. }
        ));

        // Both shared holders must leave before the writer gets in.
        assert!(matches!(
            release(&mut table, "k", "r1"),
            LockApplied::Released { ref granted, .. } if granted.is_empty()
        ));
        match release(&mut table, "k", "r2") {
            LockApplied::Released { granted, .. } => {
                assert_eq!(granted, vec![("w".to_string(), LockMode::Exclusive)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn consecutive_shared_waiters_admitted_together() {
        let mut table = LockTable::new();
        acquire(&mut table, "k", "writer", LockMode::Exclusive);
        acquire(&mut table, "k", "s1", LockMode::Shared);
        acquire(&mut table, "k", "s2", LockMode::Shared);
        acquire(&mut table, "k", "w2", LockMode::Exclusive);

        match release(&mut table, "k", "writer") {
            LockApplied::Released { granted, .. } => {
                assert_eq!(granted, vec![
                    ("s1".to_string(), LockMode::Shared),
                    ("s2".to_string(), LockMode::Shared),
                ]);
            }
            other => panic!("unexpected {:?}", other),
        }
        let status = table.status("k").unwrap();
        assert_eq!(status.mode, LockMode::Shared);
        assert_eq!(status.waiting_count, 1);
    }

    #[test]
    fn deadlock_is_refused_not_enqueued() {
        let mut table = LockTable::new();
        acquire(&mut table, "A", "c1", LockMode::Exclusive);
        acquire(&mut table, "B", "c2", LockMode::Exclusive);

        // c1 waits on B: edge c1 -> c2.
        assert!(matches!(
            acquire(&mut table, "B", "c1", LockMode::Exclusive),
            LockApplied::Waiting { .. }
        ));
        // c2 asking for A would close the cycle.
        assert!(matches!(
            acquire(&mut table, "A", "c2", LockMode::Exclusive),
            LockApplied::Deadlock { .. }
        ));

        // Neither lock was preempted, and c2 was not enqueued.
        assert_eq!(table.status("A").unwrap().holders, vec!["c1"]);
        assert_eq!(table.status("A").unwrap().waiting_count, 0);
        assert_eq!(table.status("B").unwrap().holders, vec!["c2"]);
        assert_eq!(table.status("B").unwrap().waiting_count, 1);
    }

    #[test]
    fn cycle_check_on_empty_graph_is_false() {
        let table = LockTable::new();
        assert!(!table.would_deadlock("anyone", "missing"));
    }

    #[test]
    fn waiters_are_fifo() {
        let mut table = LockTable::new();
        acquire(&mut table, "k", "h", LockMode::Exclusive);
        for (i, w) in ["w1", "w2", "w3"].iter().enumerate() {
            match acquire(&mut table, "k", w, LockMode::Exclusive) {
                LockApplied::Waiting { position, .. } => assert_eq!(position, i + 1),
                other => panic!("unexpected {:?}", other),
            }
        }
        for expected in ["w1", "w2", "w3"] {
            let current = table.status("k").unwrap().holders[0].clone();
            match release(&mut table, "k", &current) {
                LockApplied::Released { granted, .. } => {
                    assert_eq!(granted[0].0, expected);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn acquire_release_leaves_no_trace() {
        let mut table = LockTable::new();
        acquire(&mut table, "x", "c1", LockMode::Exclusive);
        release(&mut table, "x", "c1");
        assert!(table.is_empty());
        assert!(table.status("x").is_none());
    }

    #[test]
    fn release_by_stranger_is_rejected() {
        let mut table = LockTable::new();
        acquire(&mut table, "k", "owner", LockMode::Exclusive);
        assert!(matches!(
            release(&mut table, "k", "stranger"),
            LockApplied::NotHolder { .. }
        ));
        assert!(matches!(
            release(&mut table, "missing", "anyone"),
            LockApplied::NotFound { .. }
        ));
    }

    #[test]
    fn expiry_lists_every_holder_of_stale_locks() {
        let mut table = LockTable::new();
        table.apply(LockCommand::Acquire {
            lock_id: "old".to_string(),
            requester: "c1".to_string(),
            mode: LockMode::Exclusive,
            timeout_secs: 0,
        });
        acquire(&mut table, "fresh", "c2", LockMode::Exclusive);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let expired = table.expired_holders();
        assert_eq!(expired, vec![("old".to_string(), "c1".to_string())]);

        // An Expire command releases and flags the timeout.
        match table.apply(LockCommand::Expire {
            lock_id: "old".to_string(),
            holder: "c1".to_string(),
        }) {
            LockApplied::Released { timed_out, .. } => assert!(timed_out),
            other => panic!("unexpected {:?}", other),
        }
        assert!(table.status("old").is_none());
    }
}
