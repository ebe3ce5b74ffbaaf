//! # memory transport
//!
//! why: run whole clusters inside one process, with partitions on demand
//! relations: implements the Transport trait from transport/mod.rs
//! what: MemoryRouter

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use raft_core::{NodeId, RaftMessage, RaftReply};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::{Inbox, InboundRpc, ListenerGuard, Transport, INBOX_CAPACITY};
use crate::error::TransportError;

#[derive(Debug, Default)]
struct Routes {
    listeners: HashMap<NodeId, (u64, mpsc::Sender<InboundRpc>)>,
    /// Isolated nodes can neither send nor receive.
    isolated: HashSet<NodeId>,
    next_generation: u64,
}

/// In-process router shared by every node of a test cluster.
#[derive(Debug, Clone, Default)]
pub struct MemoryRouter {
    routes: Arc<Mutex<Routes>>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        // the map stays consistent even if a holder panicked
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cut `node` off from every other node.
    pub fn isolate(&self, node: &NodeId) {
        self.routes().isolated.insert(node.clone());
    }

    pub fn heal(&self, node: &NodeId) {
        self.routes().isolated.remove(node);
    }

    pub fn heal_all(&self) {
        self.routes().isolated.clear();
    }

    /// Whether something is listening at `addr`.
    pub fn is_listening(&self, addr: &NodeId) -> bool {
        self.routes().listeners.contains_key(addr)
    }
}

impl Transport for MemoryRouter {
    async fn listen(&self, addr: &NodeId) -> Result<Inbox, TransportError> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let generation = {
            let mut routes = self.routes();
            if routes.listeners.contains_key(addr) {
                return Err(TransportError::AddressInUse(addr.clone()));
            }
            routes.next_generation += 1;
            let generation = routes.next_generation;
            routes.listeners.insert(addr.clone(), (generation, tx));
            generation
        };

        let router = self.clone();
        let addr = addr.clone();
        let guard = ListenerGuard::new(move || {
            let mut routes = router.routes();
            // a newer listener may have taken the address since
            if routes.listeners.get(&addr).is_some_and(|(g, _)| *g == generation) {
                routes.listeners.remove(&addr);
            }
        });
        Ok(Inbox::new(rx, guard))
    }

    async fn send(&self, peer: &NodeId, message: RaftMessage) -> Result<RaftReply, TransportError> {
        let target = {
            let routes = self.routes();
            let cut = routes.isolated.contains(peer) || routes.isolated.contains(message.sender());
            let target = match routes.listeners.get(peer) {
                Some((_, tx)) if !cut => Some(tx.clone()),
                _ => None,
            };
            target
        };
        let Some(target) = target else {
            return Err(TransportError::Unreachable(peer.clone()));
        };

        trace!(%peer, rpc = message.kind(), "routing");
        let (respond_to, reply) = oneshot::channel();
        target
            .send(InboundRpc {
                message,
                respond_to,
            })
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;
        reply.await.map_err(|_| TransportError::Closed)
    }
}
