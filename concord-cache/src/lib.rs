// SPDX-License-Identifier: MIT

pub mod store;

pub use store::{CacheEntry, CacheState, CacheStore, EvictionPolicy};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use concord_core::{MessageKind, PeerId};
use concord_transport::Transport;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_FANOUT_DEADLINE: Duration = Duration::from_secs(2);

/// Coherence traffic between cache peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheMsg {
    Invalidate { key: String },
    Fetch { key: String },
    FetchReply { key: String, value: Option<Value>, version: u64 },
}

/// Where modified lines go when they leave the cache. Interface only; the
/// default sink just records the fact in the log.
pub trait BackingStore: Send + Sync {
    fn write_back(&self, key: &str, value: &Value, version: u64);
}

pub struct LogBackingStore;

impl BackingStore for LogBackingStore {
    fn write_back(&self, key: &str, _value: &Value, version: u64) {
        info!("[Cache] Writing back {} (version {})", key, version);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GetResult {
    Hit { value: Value, state: CacheState, version: u64 },
    Miss,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutResult {
    pub state: CacheState,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub policy: String,
    pub capacity: usize,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub invalidations: u64,
}

/// One node's coherent cache.
///
/// Lines move through the MESI states; writes invalidate remote copies
/// before installing locally, reads fetch a shared copy from whichever
/// peer holds one. The per-key directory is advisory: when it knows the
/// holders only they are contacted, when it knows nothing the whole peer
/// set is asked, and stale entries cost an idempotent no-op message.
pub struct CacheNode {
    self_id: PeerId,
    peers: Vec<PeerId>,
    transport: Arc<Transport>,
    store: Mutex<CacheStore>,
    directory: Mutex<HashMap<String, HashSet<PeerId>>>,
    backing: Box<dyn BackingStore>,
    fanout_deadline: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheNode {
    pub fn new(
        self_id: PeerId,
        peers: Vec<PeerId>,
        capacity: usize,
        policy: EvictionPolicy,
        transport: Arc<Transport>,
        backing: Box<dyn BackingStore>,
    ) -> Arc<Self> {
        info!("[Cache] Node {} using {} policy, capacity {}", self_id, policy, capacity);
        Arc::new(Self {
            self_id,
            peers,
            transport,
            store: Mutex::new(CacheStore::new(capacity, policy)),
            directory: Mutex::new(HashMap::new()),
            backing,
            fanout_deadline: DEFAULT_FANOUT_DEADLINE,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        })
    }

    /// Wire this cache into the transport's `Cache` channel.
    pub async fn register(self: Arc<Self>) {
        let cache = self.clone();
        self.transport
            .register_handler(
                MessageKind::Cache,
                Box::new(move |envelope| {
                    let cache = cache.clone();
                    Box::pin(async move {
                        let msg: CacheMsg = serde_json::from_slice(&envelope.payload)?;
                        cache.handle_peer(envelope.sender, msg).await
                    })
                }),
            )
            .await;
    }

    pub async fn get(&self, key: &str, _requester: &str) -> Result<GetResult> {
        {
            let mut store = self.store.lock().await;
            if let Some(entry) = store.get(key) {
                if entry.state != CacheState::Invalid {
                    store.touch(key);
                    let entry = store.get(key).unwrap();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("[Cache] Hit for {} ({:?})", key, entry.state);
                    return Ok(GetResult::Hit {
                        value: entry.value.clone(),
                        state: entry.state,
                        version: entry.version,
                    });
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("[Cache] Miss for {}", key);

        // Ask whoever the directory says holds a copy; with no directory
        // knowledge, ask everyone.
        let payload = serde_json::to_vec(&CacheMsg::Fetch { key: key.to_string() })?;
        for peer in self.targets_for(key).await {
            let Ok(Some(bytes)) = self
                .transport
                .send(peer, MessageKind::Cache, payload.clone(), true)
                .await
            else {
                continue;
            };
            let Ok(CacheMsg::FetchReply { value: Some(value), version, .. }) =
                serde_json::from_slice(&bytes)
            else {
                continue;
            };

            let entry = CacheEntry::new(value.clone(), CacheState::Shared, version);
            self.install(key.to_string(), entry).await;
            let mut directory = self.directory.lock().await;
            let holders = directory.entry(key.to_string()).or_default();
            holders.insert(self.self_id);
            holders.insert(peer);
            info!("[Cache] Fetched {} from peer {} as shared", key, peer);
            return Ok(GetResult::Hit { value, state: CacheState::Shared, version });
        }

        Ok(GetResult::Miss)
    }

    pub async fn put(&self, key: &str, value: Value, _requester: &str) -> Result<PutResult> {
        let others: Vec<PeerId> = {
            let directory = self.directory.lock().await;
            directory
                .get(key)
                .map(|holders| holders.iter().copied().filter(|p| *p != self.self_id).collect())
                .unwrap_or_default()
        };
        let had_others = !others.is_empty();
        let targets = if had_others { others } else { self.peers.clone() };
        self.fanout_invalidate(key, targets).await?;

        let state = if had_others { CacheState::Modified } else { CacheState::Exclusive };
        let version = {
            let mut store = self.store.lock().await;
            match store.get_mut(key) {
                Some(entry) => {
                    entry.value = value;
                    entry.state = state;
                    entry.version += 1;
                    let version = entry.version;
                    store.touch(key);
                    version
                }
                None => {
                    let evicted = store.insert(key.to_string(), CacheEntry::new(value, state, 1));
                    drop(store);
                    if let Some((victim_key, victim)) = evicted {
                        if victim.state == CacheState::Modified {
                            self.backing.write_back(&victim_key, &victim.value, victim.version);
                        }
                        self.directory.lock().await.remove(&victim_key);
                    }
                    1
                }
            }
        };

        self.directory
            .lock()
            .await
            .insert(key.to_string(), HashSet::from([self.self_id]));
        info!("[Cache] Cached {} in state {:?} (version {})", key, state, version);
        Ok(PutResult { state, version })
    }

    /// Locally drop the key, writing back a modified line first. Incoming
    /// peer invalidations and the client-facing invalidate action both land
    /// here. Idempotent.
    pub async fn invalidate_local(&self, key: &str, new_owner: Option<PeerId>) -> bool {
        let found = {
            let mut store = self.store.lock().await;
            match store.get_mut(key) {
                Some(entry) if entry.state != CacheState::Invalid => {
                    if entry.state == CacheState::Modified {
                        self.backing.write_back(key, &entry.value, entry.version);
                    }
                    entry.state = CacheState::Invalid;
                    true
                }
                _ => false,
            }
        };

        let mut directory = self.directory.lock().await;
        match new_owner {
            Some(owner) => {
                directory.insert(key.to_string(), HashSet::from([owner]));
            }
            None => {
                if let Some(holders) = directory.get_mut(key) {
                    holders.remove(&self.self_id);
                    if holders.is_empty() {
                        directory.remove(key);
                    }
                }
            }
        }

        if found {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            info!("[Cache] Invalidated {}", key);
        }
        found
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let targets = {
            let directory = self.directory.lock().await;
            match directory.get(key) {
                Some(holders) => {
                    holders.iter().copied().filter(|p| *p != self.self_id).collect()
                }
                None => self.peers.clone(),
            }
        };
        self.fanout_invalidate(key, targets).await?;

        let removed = {
            let mut store = self.store.lock().await;
            store.remove(key)
        };
        if let Some(entry) = &removed {
            if entry.state == CacheState::Modified {
                self.backing.write_back(key, &entry.value, entry.version);
            }
        }
        self.directory.lock().await.remove(key);
        if removed.is_some() {
            info!("[Cache] Deleted {}", key);
        }
        Ok(removed.is_some())
    }

    async fn handle_peer(&self, from: PeerId, msg: CacheMsg) -> Result<Option<Vec<u8>>> {
        match msg {
            CacheMsg::Invalidate { key } => {
                self.invalidate_local(&key, Some(from)).await;
                Ok(None)
            }
            CacheMsg::Fetch { key } => {
                let mut store = self.store.lock().await;
                let reply = match store.get_mut(&key) {
                    Some(entry) if entry.state != CacheState::Invalid => {
                        // Serving a remote read demotes our copy to shared.
                        if entry.state == CacheState::Modified {
                            self.backing.write_back(&key, &entry.value, entry.version);
                        }
                        entry.state = CacheState::Shared;
                        CacheMsg::FetchReply {
                            key: key.clone(),
                            value: Some(entry.value.clone()),
                            version: entry.version,
                        }
                    }
                    _ => CacheMsg::FetchReply { key: key.clone(), value: None, version: 0 },
                };
                drop(store);

                if matches!(reply, CacheMsg::FetchReply { value: Some(_), .. }) {
                    let mut directory = self.directory.lock().await;
                    let holders = directory.entry(key).or_default();
                    holders.insert(self.self_id);
                    holders.insert(from);
                }
                Ok(Some(serde_json::to_vec(&reply)?))
            }
            CacheMsg::FetchReply { .. } => Ok(None),
        }
    }

    /// Best-effort invalidation fan-out: every send runs concurrently and
    /// the whole group is bounded by one deadline. Unreachable peers are
    /// logged and skipped.
    async fn fanout_invalidate(&self, key: &str, targets: Vec<PeerId>) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_vec(&CacheMsg::Invalidate { key: key.to_string() })?;
        let sends = targets.iter().map(|peer| {
            let payload = payload.clone();
            async move {
                (*peer, self.transport.send(*peer, MessageKind::Cache, payload, true).await)
            }
        });

        match tokio::time::timeout(self.fanout_deadline, join_all(sends)).await {
            Ok(results) => {
                for (peer, result) in results {
                    if let Err(e) = result {
                        warn!("[Cache] Invalidate of {} on peer {} failed: {:#}", key, peer, e);
                    }
                }
            }
            Err(_) => {
                warn!("[Cache] Invalidate fan-out for {} hit the deadline", key);
            }
        }
        Ok(())
    }

    async fn targets_for(&self, key: &str) -> Vec<PeerId> {
        let directory = self.directory.lock().await;
        match directory.get(key) {
            Some(holders) if holders.iter().any(|p| *p != self.self_id) => {
                holders.iter().copied().filter(|p| *p != self.self_id).collect()
            }
            _ => self.peers.clone(),
        }
    }

    async fn install(&self, key: String, entry: CacheEntry) {
        let evicted = {
            let mut store = self.store.lock().await;
            store.insert(key, entry)
        };
        if let Some((victim_key, victim)) = evicted {
            if victim.state == CacheState::Modified {
                self.backing.write_back(&victim_key, &victim.value, victim.version);
            }
            self.directory.lock().await.remove(&victim_key);
        }
    }

    pub async fn stats(&self) -> CacheStatsSnapshot {
        let store = self.store.lock().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatsSnapshot {
            policy: store.policy().to_string(),
            capacity: store.capacity(),
            size: store.len(),
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 * 100.0 / total as f64 } else { 0.0 },
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    pub async fn entries(&self) -> Vec<(String, CacheEntry)> {
        let store = self.store.lock().await;
        store
            .keys()
            .filter_map(|k| store.get(k).map(|e| (k.clone(), e.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lone_cache() -> Arc<CacheNode> {
        CacheNode::new(
            0,
            Vec::new(),
            8,
            EvictionPolicy::Lru,
            Transport::new(0),
            Box::new(LogBackingStore),
        )
    }

    #[tokio::test]
    async fn put_get_invalidate_on_a_single_node() {
        let cache = lone_cache();

        assert_eq!(cache.get("k", "c").await.unwrap(), GetResult::Miss);
        let put = cache.put("k", json!({"n": 1}), "c").await.unwrap();
        assert_eq!(put.state, CacheState::Exclusive);
        assert_eq!(put.version, 1);

        match cache.get("k", "c").await.unwrap() {
            GetResult::Hit { state, version, .. } => {
                assert_eq!(state, CacheState::Exclusive);
                assert_eq!(version, 1);
            }
            GetResult::Miss => panic!("expected a hit"),
        }

        assert!(cache.invalidate_local("k", None).await);
        assert_eq!(cache.get("k", "c").await.unwrap(), GetResult::Miss);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.invalidations, 1);
    }

    #[tokio::test]
    async fn updating_a_key_bumps_its_version() {
        let cache = lone_cache();
        cache.put("k", json!(1), "c").await.unwrap();
        let put = cache.put("k", json!(2), "c").await.unwrap();
        assert_eq!(put.version, 2);
    }
}
