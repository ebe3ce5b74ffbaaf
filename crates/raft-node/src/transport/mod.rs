//! # transport
//!
//! why: move raft rpcs between nodes without the actor knowing how
//! relations: actor.rs drains an Inbox and sends through a Transport; memory.rs and tcp.rs implement it
//! what: Transport trait, InboundRpc, Inbox, ListenerGuard

use std::fmt;
use std::future::Future;

use raft_core::{NodeId, RaftMessage, RaftReply};
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;

pub mod memory;
pub mod tcp;

pub use memory::MemoryRouter;
pub use tcp::TcpTransport;

/// Capacity of an inbox before senders wait.
pub(crate) const INBOX_CAPACITY: usize = 256;

/// Request/response delivery between nodes.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Start accepting rpcs addressed to `addr`. Dropping the returned inbox
    /// stops accepting them.
    fn listen(&self, addr: &NodeId) -> impl Future<Output = Result<Inbox, TransportError>> + Send;

    /// Deliver `message` to `peer` and wait for its reply.
    fn send(
        &self,
        peer: &NodeId,
        message: RaftMessage,
    ) -> impl Future<Output = Result<RaftReply, TransportError>> + Send;
}

/// An rpc waiting for the local node's answer.
#[derive(Debug)]
pub struct InboundRpc {
    pub message: RaftMessage,
    pub respond_to: oneshot::Sender<RaftReply>,
}

impl InboundRpc {
    pub fn respond(self, reply: RaftReply) {
        // the caller may have timed out already
        let _ = self.respond_to.send(reply);
    }
}

/// Releases a listener registration when dropped.
pub struct ListenerGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Receiving end of a listener.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<InboundRpc>,
    _guard: ListenerGuard,
}

impl Inbox {
    pub fn new(rx: mpsc::Receiver<InboundRpc>, guard: ListenerGuard) -> Self {
        Self { rx, _guard: guard }
    }

    /// Next inbound rpc; `None` once the transport side is gone.
    pub async fn recv(&mut self) -> Option<InboundRpc> {
        self.rx.recv().await
    }
}
