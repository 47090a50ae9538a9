// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::str::FromStr;

use concord_core::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Modified,
    Exclusive,
    Shared,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LRU" => Ok(Self::Lru),
            "LFU" => Ok(Self::Lfu),
            "FIFO" => Ok(Self::Fifo),
            other => Err(format!("unknown cache policy '{}'", other)),
        }
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lru => write!(f, "LRU"),
            Self::Lfu => write!(f, "LFU"),
            Self::Fifo => write!(f, "FIFO"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub value: Value,
    pub state: CacheState,
    pub version: u64,
    pub created_at_ms: u64,
    pub last_accessed_ms: u64,
    pub access_count: u64,
}

impl CacheEntry {
    pub fn new(value: Value, state: CacheState, version: u64) -> Self {
        let now = now_ms();
        Self {
            value,
            state,
            version,
            created_at_ms: now,
            last_accessed_ms: now,
            access_count: 0,
        }
    }

    pub fn access(&mut self) {
        self.last_accessed_ms = now_ms();
        self.access_count += 1;
    }
}

/// Bounded entry table. Recency is tracked with an explicit order list
/// (front = coldest) rather than timestamps, so eviction stays
/// deterministic inside one millisecond.
pub struct CacheStore {
    capacity: usize,
    policy: EvictionPolicy,
    entries: HashMap<String, CacheEntry>,
    order: Vec<String>,
}

impl CacheStore {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// Record a hit: bumps recency/frequency and, under LRU, moves the key
    /// to the warm end.
    pub fn touch(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.access();
            if self.policy == EvictionPolicy::Lru {
                self.move_to_back(key);
            }
        }
    }

    /// Insert or replace. Returns the evicted `(key, entry)` if the insert
    /// pushed the store past capacity.
    pub fn insert(&mut self, key: String, entry: CacheEntry) -> Option<(String, CacheEntry)> {
        let replaced = self.entries.insert(key.clone(), entry).is_some();
        if replaced {
            if self.policy == EvictionPolicy::Lru {
                self.move_to_back(&key);
            }
            return None;
        }
        self.order.push(key);

        if self.entries.len() <= self.capacity {
            return None;
        }
        let victim = self.victim()?;
        let entry = self.remove(&victim)?;
        debug!("[Cache] Evicted {} ({})", victim, self.policy);
        Some((victim, entry))
    }

    fn victim(&self) -> Option<String> {
        match self.policy {
            // Coldest first for LRU, oldest insertion for FIFO; the order
            // list is maintained accordingly.
            EvictionPolicy::Lru | EvictionPolicy::Fifo => self.order.first().cloned(),
            // Fewest accesses; ties fall to the older entry.
            EvictionPolicy::Lfu => self
                .order
                .iter()
                .enumerate()
                .min_by_key(|(position, key)| {
                    (self.entries.get(*key).map(|e| e.access_count).unwrap_or(0), *position)
                })
                .map(|(_, key)| key.clone()),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.order.retain(|k| k != key);
        self.entries.remove(key)
    }

    fn move_to_back(&mut self, key: &str) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(position);
            self.order.push(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }
}
