//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-node's actor, persisted through raft-storage adapters
//! what: state machine, election logic, log replication, message types, storage contracts
//!
//! Nothing in this crate performs I/O or owns a clock. Every handler takes the
//! inbound message, mutates [`RaftNode`], writes through the [`LogStorage`]
//! before returning, and tells the caller what to send and whether the
//! election timer must be reset.

pub mod config;
pub mod election;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod replication;
pub mod storage;

pub use config::{ConfigError, RaftConfig};
pub use error::{RaftError, StorageError};
pub use log::{Command, CommandOutput, EntryPayload, LogEntry, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, AppendSent, LogHint, RaftMessage, RaftReply,
    VoteRequest, VoteResponse,
};
pub use node::{NodeId, NodeState, NodeStatus, Peer, RaftNode};
pub use replication::ReplicationOutcome;
pub use storage::{HardState, LogStorage, MemLogStorage, StateMachine};
