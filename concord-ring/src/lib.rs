// SPDX-License-Identifier: MIT

use std::collections::{BTreeMap, BTreeSet};

use sha1::{Digest, Sha1};
use tracing::info;

pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Consistent hash ring. Each physical node contributes `virtual_nodes`
/// points on a 128-bit circle; a key belongs to the first point at or past
/// its hash, wrapping at the top.
#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    ring: BTreeMap<u128, String>,
    nodes: BTreeSet<String>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes,
            ring: BTreeMap::new(),
            nodes: BTreeSet::new(),
        }
    }

    /// Uniformity is all that matters here; the first 16 digest bytes give
    /// the 128-bit position.
    fn hash(key: &str) -> u128 {
        let digest = Sha1::digest(key.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        u128::from_be_bytes(bytes)
    }

    pub fn add_node(&mut self, node_id: &str) {
        if !self.nodes.insert(node_id.to_string()) {
            return;
        }
        for i in 0..self.virtual_nodes {
            let point = Self::hash(&format!("{}:{}", node_id, i));
            self.ring.insert(point, node_id.to_string());
        }
        info!("[Ring] Added node {} ({} points)", node_id, self.virtual_nodes);
    }

    pub fn remove_node(&mut self, node_id: &str) {
        if !self.nodes.remove(node_id) {
            return;
        }
        for i in 0..self.virtual_nodes {
            let point = Self::hash(&format!("{}:{}", node_id, i));
            self.ring.remove(&point);
        }
        info!("[Ring] Removed node {}", node_id);
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The node responsible for `key`, or None on an empty ring.
    pub fn node_of(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let h = Self::hash(key);
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
    }

    /// Up to `count` distinct physical nodes, walking forward from the
    /// key's position.
    pub fn replicas(&self, key: &str, count: usize) -> Vec<String> {
        if self.ring.is_empty() || count == 0 {
            return Vec::new();
        }
        let h = Self::hash(key);
        let mut out: Vec<String> = Vec::new();
        for (_, node) in self.ring.range(h..).chain(self.ring.range(..h)) {
            if !out.iter().any(|n| n == node) {
                out.push(node.clone());
                if out.len() == count || out.len() == self.nodes.len() {
                    break;
                }
            }
        }
        out
    }
}
