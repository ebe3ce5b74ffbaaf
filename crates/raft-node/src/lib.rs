//! # raft-node
//!
//! why: run the raft protocol of raft-core as a live cluster member
//! relations: drives raft-core's RaftNode, persists through its LogStorage/StateMachine traits
//! what: Node façade, single-task actor, election timer, memory and tcp transports

mod actor;
mod apply;
pub mod error;
pub mod event;
pub mod node;
mod timer;
pub mod transport;

pub use error::{CommandError, NodeError, TransportError};
pub use event::NodeEvent;
pub use node::Node;
pub use transport::{Inbox, InboundRpc, ListenerGuard, MemoryRouter, TcpTransport, Transport};

// re-exported so applications depend on one crate for the common types
pub use raft_core::{Command, CommandOutput, NodeId, NodeState, NodeStatus, RaftConfig};
