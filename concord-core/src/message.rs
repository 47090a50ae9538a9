// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// Multiplexing tag for peer-to-peer frames. Handlers register per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Acknowledgement frame; carries the handler's reply bytes, if any.
    Ack,
    Heartbeat,
    Raft,
    Queue,
    Cache,
}

/// One peer-to-peer message as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique, monotonic per origin: `node:timestamp_ms:counter`.
    pub id: String,
    pub kind: MessageKind,
    pub sender: PeerId,
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
    pub requires_ack: bool,
}

impl Envelope {
    /// The ack frame for this envelope, optionally carrying reply bytes.
    pub fn ack(&self, sender: PeerId, reply: Option<Vec<u8>>) -> Envelope {
        Envelope {
            id: format!("ack:{}", self.id),
            kind: MessageKind::Ack,
            sender,
            payload: reply.unwrap_or_default(),
            timestamp_ms: crate::now_ms(),
            requires_ack: false,
        }
    }
}
