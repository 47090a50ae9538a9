// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use concord_core::PeerId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::wal::{LogEntry, WriteAheadLog};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RaftMessage {
    AppendEntries {
        term: u64,
        leader_id: PeerId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
        match_index: u64,
        conflict_index: u64,
    },
    VoteRequest {
        term: u64,
        candidate_id: PeerId,
        last_log_index: u64,
        last_log_term: u64,
    },
    VoteResponse {
        term: u64,
        vote_granted: bool,
    },
}

impl RaftMessage {
    fn term(&self) -> u64 {
        match self {
            RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. } => *term,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RaftConfig {
    pub id: PeerId,
    /// Every cluster member, self included.
    pub members: Vec<PeerId>,
    pub storage_path: PathBuf,
    pub election_timeout_ms: (u64, u64),
    pub heartbeat_interval_ms: u64,
}

impl RaftConfig {
    fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

/// Committed commands land here, in log-index order, on every replica.
/// The snapshot hooks reserve the compaction boundary; log compaction
/// itself is not implemented.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, index: u64, command: &[u8]);
    fn snapshot(&self) -> Vec<u8> {
        Vec::new()
    }
    fn restore(&self, _snapshot: &[u8]) {}
}

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("not the leader")]
    NotLeader { leader: Option<PeerId> },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub id: PeerId,
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<PeerId>,
    pub last_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
}

struct VolatileState {
    role: RaftRole,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<PeerId>,
    last_heartbeat: Instant,
    election_timeout: Duration,
    votes: HashSet<PeerId>,
}

struct LeaderState {
    next_index: HashMap<PeerId, u64>,
    match_index: HashMap<PeerId, u64>,
}

impl LeaderState {
    fn new(peers: impl Iterator<Item = PeerId>, next: u64) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in peers {
            next_index.insert(peer, next);
            match_index.insert(peer, 0);
        }
        Self { next_index, match_index }
    }
}

/// One Raft replica. Messages arrive through `handle_message`, outbound
/// RPCs leave on the outbox channel, committed entries flow into the
/// state machine in index order, and the applied index is published on a
/// watch channel so proposers can wait for their command to land.
pub struct RaftNode {
    config: RaftConfig,
    wal: Mutex<WriteAheadLog>,
    state_machine: Arc<dyn StateMachine>,
    v_state: RwLock<VolatileState>,
    l_state: Mutex<Option<LeaderState>>,
    outbox: mpsc::Sender<(PeerId, RaftMessage)>,
    applied_tx: watch::Sender<u64>,
}

impl RaftNode {
    pub async fn start(
        config: RaftConfig,
        state_machine: Arc<dyn StateMachine>,
        outbox: mpsc::Sender<(PeerId, RaftMessage)>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>> {
        let wal = WriteAheadLog::open(&config.storage_path)?;
        let hs = wal.hard_state();
        let last_index = wal.last_index();

        // In-memory state machines rebuild by replaying the recovered log.
        for entry in wal.entries_from(1) {
            state_machine.apply(entry.index, &entry.command);
        }

        info!(
            "[Raft] Node {} recovered: term={}, last_index={}",
            config.id, hs.current_term, last_index
        );

        let (applied_tx, _) = watch::channel(last_index);
        let timeout = Self::random_timeout(&config);
        let node = Arc::new(Self {
            config,
            wal: Mutex::new(wal),
            state_machine,
            v_state: RwLock::new(VolatileState {
                role: RaftRole::Follower,
                commit_index: last_index,
                last_applied: last_index,
                leader_id: None,
                last_heartbeat: Instant::now(),
                election_timeout: timeout,
                votes: HashSet::new(),
            }),
            l_state: Mutex::new(None),
            outbox,
            applied_tx,
        });

        let ticker = node.clone();
        tokio::spawn(async move { ticker.run_tick_loop(shutdown).await });
        Ok(node)
    }

    fn random_timeout(config: &RaftConfig) -> Duration {
        let (min, max) = config.election_timeout_ms;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    async fn run_tick_loop(&self, shutdown: watch::Receiver<bool>) {
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if *shutdown.borrow() {
                info!("[Raft] Node {} stopped", self.config.id);
                return;
            }

            let mut v = self.v_state.write().await;
            match v.role {
                RaftRole::Follower | RaftRole::Candidate => {
                    if v.last_heartbeat.elapsed() > v.election_timeout {
                        self.start_election(&mut v).await;
                    }
                }
                RaftRole::Leader => {
                    if v.last_heartbeat.elapsed()
                        >= Duration::from_millis(self.config.heartbeat_interval_ms)
                    {
                        v.last_heartbeat = Instant::now();
                        let wal = self.wal.lock().await;
                        let mut ls = self.l_state.lock().await;
                        if let Some(ls) = ls.as_mut() {
                            self.replicate(&wal, &v, ls).await;
                        }
                    }
                }
            }
        }
    }

    async fn start_election(&self, v: &mut VolatileState) {
        let mut wal = self.wal.lock().await;
        let mut hs = wal.hard_state();
        hs.current_term += 1;
        if let Err(e) = wal.save_hard_state(hs.current_term, Some(self.config.id)) {
            warn!("[Raft] Failed to persist vote: {:#}", e);
            return;
        }

        v.role = RaftRole::Candidate;
        v.leader_id = None;
        v.votes.clear();
        v.votes.insert(self.config.id);
        v.last_heartbeat = Instant::now();
        v.election_timeout = Self::random_timeout(&self.config);

        info!("[Raft] Node {} starting election for term {}", self.config.id, hs.current_term);

        // A singleton cluster is its own majority.
        if v.votes.len() >= self.config.quorum() {
            self.become_leader(hs.current_term, v, &wal).await;
            return;
        }

        let (last_log_index, last_log_term) = wal.last_log_info();
        drop(wal);
        let request = RaftMessage::VoteRequest {
            term: hs.current_term,
            candidate_id: self.config.id,
            last_log_index,
            last_log_term,
        };
        for peer in self.peers() {
            let _ = self.outbox.send((peer, request.clone())).await;
        }
    }

    async fn become_leader(&self, term: u64, v: &mut VolatileState, wal: &WriteAheadLog) {
        info!("[Raft] Node {} elected LEADER for term {}", self.config.id, term);
        v.role = RaftRole::Leader;
        v.leader_id = Some(self.config.id);
        v.last_heartbeat = Instant::now();

        let mut ls = self.l_state.lock().await;
        *ls = Some(LeaderState::new(self.peers(), wal.last_index() + 1));
        self.replicate(wal, v, ls.as_mut().unwrap()).await;
    }

    /// Ship each peer everything from its next index; an up-to-date peer
    /// gets an empty AppendEntries, which is the heartbeat.
    async fn replicate(&self, wal: &WriteAheadLog, v: &VolatileState, ls: &mut LeaderState) {
        let term = wal.hard_state().current_term;
        for peer in self.peers() {
            let next = *ls.next_index.get(&peer).unwrap_or(&(wal.last_index() + 1));
            let prev_log_index = next.saturating_sub(1);
            let message = RaftMessage::AppendEntries {
                term,
                leader_id: self.config.id,
                prev_log_index,
                prev_log_term: wal.term_at(prev_log_index),
                entries: wal.entries_from(next),
                leader_commit: v.commit_index,
            };
            let _ = self.outbox.send((peer, message)).await;
        }
    }

    /// Single entry point for every inbound Raft RPC.
    pub async fn handle_message(&self, from: PeerId, message: RaftMessage) -> Result<()> {
        let mut v = self.v_state.write().await;
        let mut wal = self.wal.lock().await;
        let mut hs = wal.hard_state();

        if message.term() > hs.current_term {
            info!("[Raft] Node {} saw higher term {}, stepping down", self.config.id, message.term());
            hs.current_term = message.term();
            wal.save_hard_state(hs.current_term, None)?;
            hs = wal.hard_state();
            v.role = RaftRole::Follower;
            v.leader_id = None;
            *self.l_state.lock().await = None;
        }

        match message {
            RaftMessage::VoteRequest { term, candidate_id, last_log_index, last_log_term } => {
                let (my_last_index, my_last_term) = wal.last_log_info();
                let log_ok = last_log_term > my_last_term
                    || (last_log_term == my_last_term && last_log_index >= my_last_index);

                let grant = if term < hs.current_term {
                    false
                } else if (hs.voted_for.is_none() || hs.voted_for == Some(candidate_id)) && log_ok {
                    wal.save_hard_state(hs.current_term, Some(candidate_id))?;
                    v.last_heartbeat = Instant::now();
                    v.election_timeout = Self::random_timeout(&self.config);
                    true
                } else {
                    false
                };

                debug!("[Raft] Vote request from {}: granted={}", candidate_id, grant);
                let _ = self
                    .outbox
                    .send((candidate_id, RaftMessage::VoteResponse {
                        term: hs.current_term,
                        vote_granted: grant,
                    }))
                    .await;
            }

            RaftMessage::VoteResponse { term, vote_granted } => {
                if v.role == RaftRole::Candidate && term == hs.current_term && vote_granted {
                    v.votes.insert(from);
                    if v.votes.len() >= self.config.quorum() {
                        self.become_leader(hs.current_term, &mut v, &wal).await;
                    }
                }
            }

            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                if term < hs.current_term {
                    let _ = self
                        .outbox
                        .send((leader_id, RaftMessage::AppendEntriesResponse {
                            term: hs.current_term,
                            success: false,
                            match_index: 0,
                            conflict_index: 0,
                        }))
                        .await;
                    return Ok(());
                }

                v.role = RaftRole::Follower;
                v.leader_id = Some(leader_id);
                v.last_heartbeat = Instant::now();

                // The log must contain the leader's previous entry.
                if prev_log_index > 0 && wal.term_at(prev_log_index) != prev_log_term {
                    let _ = self
                        .outbox
                        .send((leader_id, RaftMessage::AppendEntriesResponse {
                            term: hs.current_term,
                            success: false,
                            match_index: 0,
                            conflict_index: wal.last_index() + 1,
                        }))
                        .await;
                    return Ok(());
                }

                for entry in &entries {
                    match wal.get(entry.index) {
                        Some(existing) if existing.term == entry.term => {}
                        Some(_) => {
                            // Conflicting suffix: everything from here on goes.
                            wal.truncate_suffix(entry.index)?;
                            wal.append(entry.clone())?;
                        }
                        None => {
                            wal.append(entry.clone())?;
                        }
                    }
                }

                let last_new_index = prev_log_index + entries.len() as u64;
                if leader_commit > v.commit_index {
                    v.commit_index = leader_commit.min(last_new_index);
                    self.apply_committed(&mut v, &wal);
                }

                let _ = self
                    .outbox
                    .send((leader_id, RaftMessage::AppendEntriesResponse {
                        term: hs.current_term,
                        success: true,
                        match_index: last_new_index,
                        conflict_index: 0,
                    }))
                    .await;
            }

            RaftMessage::AppendEntriesResponse { term, success, match_index, conflict_index } => {
                if v.role != RaftRole::Leader || term != hs.current_term {
                    return Ok(());
                }
                let mut ls_guard = self.l_state.lock().await;
                if let Some(ls) = ls_guard.as_mut() {
                    if success {
                        ls.match_index.insert(from, match_index);
                        ls.next_index.insert(from, match_index + 1);
                        self.advance_commit(&mut v, &wal, ls);
                    } else {
                        let next = ls.next_index.entry(from).or_insert(1);
                        *next = if conflict_index > 0 {
                            conflict_index.min(next.saturating_sub(1)).max(1)
                        } else {
                            next.saturating_sub(1).max(1)
                        };
                    }
                }
            }
        }
        Ok(())
    }

    /// Leader-side commit rule: the highest index replicated on a quorum
    /// whose entry is from the current term.
    fn advance_commit(&self, v: &mut VolatileState, wal: &WriteAheadLog, ls: &LeaderState) {
        let mut indices: Vec<u64> = ls.match_index.values().copied().collect();
        indices.push(wal.last_index());
        indices.sort_unstable();

        let quorum = self.config.quorum();
        if indices.len() < quorum {
            return;
        }
        let majority_index = indices[indices.len() - quorum];
        if majority_index > v.commit_index
            && wal.term_at(majority_index) == wal.hard_state().current_term
        {
            v.commit_index = majority_index;
            self.apply_committed(v, wal);
        }
    }

    fn apply_committed(&self, v: &mut VolatileState, wal: &WriteAheadLog) {
        while v.last_applied < v.commit_index {
            v.last_applied += 1;
            if let Some(entry) = wal.get(v.last_applied) {
                self.state_machine.apply(entry.index, &entry.command);
            }
        }
        let _ = self.applied_tx.send(v.last_applied);
    }

    /// Append a command to the leader's log and start replicating it.
    /// Returns the assigned index; commitment is observed via
    /// `subscribe_applied`.
    pub async fn propose(&self, command: Vec<u8>) -> Result<u64, RaftError> {
        let mut v = self.v_state.write().await;
        if v.role != RaftRole::Leader {
            return Err(RaftError::NotLeader { leader: v.leader_id });
        }

        let mut wal = self.wal.lock().await;
        let term = wal.hard_state().current_term;
        let index = wal.append_command(term, command).map_err(RaftError::Storage)?;

        let mut ls = self.l_state.lock().await;
        if let Some(ls) = ls.as_mut() {
            // A singleton cluster commits on append.
            self.advance_commit(&mut v, &wal, ls);
            self.replicate(&wal, &v, ls).await;
        }
        Ok(index)
    }

    fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        let me = self.config.id;
        self.config.members.iter().copied().filter(move |p| *p != me)
    }

    pub fn subscribe_applied(&self) -> watch::Receiver<u64> {
        self.applied_tx.subscribe()
    }

    pub async fn is_leader(&self) -> bool {
        self.v_state.read().await.role == RaftRole::Leader
    }

    pub async fn leader_hint(&self) -> Option<PeerId> {
        self.v_state.read().await.leader_id
    }

    pub async fn status(&self) -> RaftStatus {
        let v = self.v_state.read().await;
        let wal = self.wal.lock().await;
        RaftStatus {
            id: self.config.id,
            role: v.role,
            term: wal.hard_state().current_term,
            leader: v.leader_id,
            last_index: wal.last_index(),
            commit_index: v.commit_index,
            last_applied: v.last_applied,
        }
    }
}
