// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use concord_cache::EvictionPolicy;
use concord_core::{ClusterMap, Member};

/// Node configuration. Every option can come from the command line or the
/// matching environment variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "concord-node", version, about = "Distributed synchronization service node")]
pub struct NodeConfig {
    #[arg(long, env = "NODE_ID", default_value = "node1")]
    pub node_id: String,

    #[arg(long, env = "NODE_HOST", default_value = "127.0.0.1")]
    pub node_host: String,

    /// Base port: lock RPCs here, queue at +100, cache at +200, peer
    /// transport at +300.
    #[arg(long, env = "NODE_PORT", default_value_t = 8001)]
    pub node_port: u16,

    /// Comma-separated members, `name:port` or `name:host:port`.
    #[arg(long, env = "CLUSTER_NODES", default_value = "node1:8001")]
    pub cluster_nodes: String,

    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 1.0)]
    pub heartbeat_interval: f64,

    #[arg(long, env = "ELECTION_TIMEOUT_MIN", default_value_t = 3.0)]
    pub election_timeout_min: f64,

    #[arg(long, env = "ELECTION_TIMEOUT_MAX", default_value_t = 5.0)]
    pub election_timeout_max: f64,

    #[arg(long, env = "CACHE_SIZE", default_value_t = 1000)]
    pub cache_size: usize,

    #[arg(long, env = "CACHE_POLICY", default_value = "LRU")]
    pub cache_policy: String,

    #[arg(long, env = "CACHE_PROTOCOL", default_value = "MESI")]
    pub cache_protocol: String,

    #[arg(long, env = "QUEUE_REPLICATION_FACTOR", default_value_t = 2)]
    pub queue_replication_factor: usize,

    /// Seconds a dequeued message may stay leased before the sweeper
    /// returns it to pending.
    #[arg(long, env = "LEASE_TIMEOUT", default_value_t = 60.0)]
    pub lease_timeout: f64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,
}

impl NodeConfig {
    pub fn cluster_map(&self) -> Result<ClusterMap> {
        let members: Vec<Member> =
            ClusterMap::parse_members(&self.cluster_nodes, &self.node_host)?;
        ClusterMap::new(members, &self.node_id)
    }

    pub fn eviction_policy(&self) -> Result<EvictionPolicy> {
        self.cache_policy.parse().map_err(anyhow::Error::msg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_protocol.to_ascii_uppercase() != "MESI" {
            bail!("unsupported cache protocol '{}'", self.cache_protocol);
        }
        if self.election_timeout_min <= 0.0 || self.election_timeout_max < self.election_timeout_min
        {
            bail!("invalid election timeout range");
        }
        self.eviction_policy()?;
        self.cluster_map()?;
        Ok(())
    }

    pub fn election_timeout_ms(&self) -> (u64, u64) {
        (
            (self.election_timeout_min * 1000.0) as u64,
            (self.election_timeout_max * 1000.0) as u64,
        )
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        (self.heartbeat_interval * 1000.0) as u64
    }

    pub fn lease_timeout_ms(&self) -> u64 {
        (self.lease_timeout * 1000.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_validate() {
        let config = NodeConfig::parse_from(["concord-node"]);
        config.validate().unwrap();
        assert_eq!(config.node_port, 8001);
        assert_eq!(config.election_timeout_ms(), (3000, 5000));
    }

    #[test]
    fn rejects_unknown_protocol() {
        let config =
            NodeConfig::parse_from(["concord-node", "--cache-protocol", "MOESI"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_node_missing_from_cluster() {
        let config = NodeConfig::parse_from([
            "concord-node",
            "--node-id",
            "node9",
            "--cluster-nodes",
            "node1:8001,node2:8002",
        ]);
        assert!(config.validate().is_err());
    }
}
