// SPDX-License-Identifier: MIT

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::PeerId;

/// One cluster member as named in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub host: String,
    /// Base port; service listeners derive from it via `crate::port`.
    pub port: u16,
}

impl Member {
    /// Address of one of the member's listeners, given a port offset.
    pub fn addr(&self, offset: u16) -> String {
        format!("{}:{}", self.host, self.port + offset)
    }
}

/// Ordered cluster membership. A member's peer id is its position in the
/// configured list, so every node derives the same numbering.
#[derive(Debug, Clone)]
pub struct ClusterMap {
    members: Vec<Member>,
    self_id: PeerId,
}

impl ClusterMap {
    pub fn new(members: Vec<Member>, self_name: &str) -> Result<Self> {
        if members.is_empty() {
            bail!("cluster has no members");
        }
        let self_id = members
            .iter()
            .position(|m| m.name == self_name)
            .with_context(|| format!("node '{}' is not in the cluster list", self_name))?
            as PeerId;
        Ok(Self { members, self_id })
    }

    /// Parse a comma-separated member list. Entries are `name:port` or
    /// `name:host:port`; a bare `name:port` lands on `default_host`.
    pub fn parse_members(list: &str, default_host: &str) -> Result<Vec<Member>> {
        let mut members = Vec::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').collect();
            let member = match parts.as_slice() {
                [name, port] => Member {
                    name: name.to_string(),
                    host: default_host.to_string(),
                    port: port.parse().with_context(|| format!("bad port in '{}'", entry))?,
                },
                [name, host, port] => Member {
                    name: name.to_string(),
                    host: host.to_string(),
                    port: port.parse().with_context(|| format!("bad port in '{}'", entry))?,
                },
                _ => bail!("bad cluster entry '{}', expected name:port or name:host:port", entry),
            };
            members.push(member);
        }
        Ok(members)
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Strict majority of the cluster.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn member(&self, id: PeerId) -> Option<&Member> {
        self.members.get(id as usize)
    }

    pub fn name_of(&self, id: PeerId) -> Option<&str> {
        self.member(id).map(|m| m.name.as_str())
    }

    pub fn id_of(&self, name: &str) -> Option<PeerId> {
        self.members.iter().position(|m| m.name == name).map(|i| i as PeerId)
    }

    /// Every peer id except our own.
    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        let me = self.self_id;
        (0..self.members.len() as PeerId).filter(move |id| *id != me)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }
}
