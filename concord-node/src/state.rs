// SPDX-License-Identifier: MIT

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use concord_core::ConcordError;
use concord_lock::{LockApplied, LockCommand, LockMode, LockTable};
use concord_queue::{QueueApplied, QueueCommand, QueueTable};
use concord_raft::StateMachine;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, warn};

/// Everything that enters the Raft log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Lock(LockCommand),
    Queue(QueueCommand),
}

/// Outcome of one applied command, routed back to the proposer.
#[derive(Debug, Clone)]
pub enum Applied {
    Lock(LockApplied),
    Queue(QueueApplied),
}

/// Observer notifications from the lock state machine.
#[derive(Debug, Clone)]
pub enum LockEvent {
    Granted { lock_id: String, requester: String, mode: LockMode },
    TimedOut { lock_id: String, holder: String },
}

/// How many applied outcomes we remember for proposers that have not
/// started waiting yet.
const COMPLETED_BACKLOG: usize = 1024;

#[derive(Default)]
struct Rendezvous {
    pending: HashMap<u64, oneshot::Sender<Applied>>,
    completed: BTreeMap<u64, Applied>,
}

/// The node's replicated state machine: committed commands are decoded
/// and dispatched into the lock and queue tables, and each outcome is
/// handed to whichever local request proposed it.
///
/// Apply runs on the Raft thread and never suspends; the tables sit
/// behind plain mutexes with short critical sections.
pub struct Router {
    pub locks: Mutex<LockTable>,
    pub queues: Mutex<QueueTable>,
    rendezvous: Mutex<Rendezvous>,
    lock_events: broadcast::Sender<LockEvent>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        let (lock_events, _) = broadcast::channel(256);
        Arc::new(Self {
            locks: Mutex::new(LockTable::new()),
            queues: Mutex::new(QueueTable::new()),
            rendezvous: Mutex::new(Rendezvous::default()),
            lock_events,
        })
    }

    pub fn subscribe_lock_events(&self) -> broadcast::Receiver<LockEvent> {
        self.lock_events.subscribe()
    }

    /// Wait for the command at `index` to be applied locally. Handles the
    /// race where the apply already happened before the proposer got here.
    pub async fn wait_for(
        &self,
        index: u64,
        deadline: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Applied, ConcordError> {
        let rx = {
            let mut r = self.rendezvous.lock().unwrap();
            if let Some(outcome) = r.completed.remove(&index) {
                return Ok(outcome);
            }
            let (tx, rx) = oneshot::channel();
            r.pending.insert(index, tx);
            rx
        };

        tokio::select! {
            outcome = rx => outcome.map_err(|_| ConcordError::Shutdown),
            _ = tokio::time::sleep(deadline) => {
                self.rendezvous.lock().unwrap().pending.remove(&index);
                Err(ConcordError::Timeout)
            }
            _ = shutdown.wait_for(|stop| *stop) => Err(ConcordError::Shutdown),
        }
    }

    fn resolve(&self, index: u64, outcome: Applied) {
        let mut r = self.rendezvous.lock().unwrap();
        match r.pending.remove(&index) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                r.completed.insert(index, outcome);
                while r.completed.len() > COMPLETED_BACKLOG {
                    r.completed.pop_first();
                }
            }
        }
    }
}

impl StateMachine for Router {
    fn apply(&self, index: u64, command: &[u8]) {
        let command: Command = match serde_json::from_slice(command) {
            Ok(c) => c,
            Err(e) => {
                warn!("[Node] Undecodable command at index {}: {}", index, e);
                return;
            }
        };
        debug!("[Node] Applying index {}", index);

        let outcome = match command {
            Command::Lock(cmd) => {
                let applied = self.locks.lock().unwrap().apply(cmd);
                if let LockApplied::Released { lock_id, holder, granted, timed_out } = &applied {
                    for (requester, mode) in granted {
                        let _ = self.lock_events.send(LockEvent::Granted {
                            lock_id: lock_id.clone(),
                            requester: requester.clone(),
                            mode: *mode,
                        });
                    }
                    if *timed_out {
                        let _ = self.lock_events.send(LockEvent::TimedOut {
                            lock_id: lock_id.clone(),
                            holder: holder.clone(),
                        });
                    }
                }
                Applied::Lock(applied)
            }
            Command::Queue(cmd) => Applied::Queue(self.queues.lock().unwrap().apply(cmd)),
        };

        self.resolve(index, outcome);
    }
}
