//! # event
//!
//! why: let applications watch a node's lifecycle without polling its status
//! relations: sent by node.rs and actor.rs over a broadcast channel
//! what: NodeEvent

use raft_core::NodeState;

/// Lifecycle and role notifications, delivered through `Node::subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Started,
    Stopped,
    RoleChanged {
        from: NodeState,
        to: NodeState,
        term: u64,
    },
    /// A non-fatal internal error, e.g. a malformed rpc reply
    Warning(String),
    /// Storage failed; the node stopped serving
    Fatal(String),
}
