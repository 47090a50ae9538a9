// SPDX-License-Identifier: MIT

pub mod cluster;
pub mod error;
pub mod message;

pub use cluster::{ClusterMap, Member};
pub use error::ConcordError;
pub use message::{Envelope, MessageKind};

/// Peer identifier: the member's position in the ordered cluster list.
pub type PeerId = u64;

/// Service port offsets relative to the configured node port.
pub mod port {
    /// Lock RPCs listen on the node port itself.
    pub const LOCK: u16 = 0;
    pub const QUEUE: u16 = 100;
    pub const CACHE: u16 = 200;
    /// Internal peer-to-peer transport.
    pub const PEER: u16 = 300;
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
