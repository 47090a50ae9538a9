// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Semantic error kinds surfaced to callers. Transient transport problems
/// are retried below this level; whatever reaches a client is final for
/// that request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConcordError {
    #[error("not the leader")]
    NotLeader { leader: Option<String> },

    #[error("deadlock detected")]
    Deadlock,

    #[error("timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("node is shutting down")]
    Shutdown,
}
