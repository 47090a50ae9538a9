// SPDX-License-Identifier: MIT

pub mod raft;
pub mod wal;

pub use raft::{RaftConfig, RaftError, RaftMessage, RaftNode, RaftRole, RaftStatus, StateMachine};
pub use wal::{HardState, LogEntry, WriteAheadLog};
