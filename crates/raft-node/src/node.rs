//! # node
//!
//! why: the public handle an application holds for one cluster member
//! relations: spawns actor.rs on start, talks to it over channels, reads its published status
//! what: Node with start, stop, join, command, is, status, subscribe

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use raft_core::{
    Command, CommandOutput, LogStorage, NodeId, NodeState, NodeStatus, RaftConfig, RaftNode,
    StateMachine,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, info_span, Instrument};

use crate::actor::{Actor, ActorExit, Control};
use crate::error::{CommandError, NodeError};
use crate::event::NodeEvent;
use crate::transport::Transport;

const EVENT_CAPACITY: usize = 64;

struct Running<S, M> {
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<ActorExit<S, M>>,
}

/// One member of a raft cluster.
///
/// Owns its log storage and state machine while stopped; while running they
/// belong to the node's actor task and come back on `stop`.
pub struct Node<T, S, M> {
    id: NodeId,
    config: RaftConfig,
    transport: T,
    peers: BTreeSet<NodeId>,
    parts: Option<(S, M)>,
    running: Option<Running<S, M>>,
    status_tx: Arc<watch::Sender<NodeStatus>>,
    status: watch::Receiver<NodeStatus>,
    events: broadcast::Sender<NodeEvent>,
}

impl<T, S, M> Node<T, S, M>
where
    T: Transport,
    S: LogStorage,
    M: StateMachine,
{
    pub fn new(
        id: impl Into<NodeId>,
        config: RaftConfig,
        transport: T,
        storage: S,
        state_machine: M,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let id = id.into();
        let (status_tx, status) = watch::channel(NodeStatus {
            id: id.clone(),
            role: NodeState::Follower,
            term: 0,
            leader: None,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            id,
            config,
            transport,
            peers: BTreeSet::new(),
            parts: Some((storage, state_machine)),
            running: None,
            status_tx: Arc::new(status_tx),
            status,
            events,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Known peers, excluding this node.
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.iter()
    }

    /// Listen for rpcs, reload durable state and start the protocol.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.running.is_some() {
            return Err(NodeError::AlreadyRunning);
        }
        if self.parts.is_none() {
            return Err(NodeError::StorageLost);
        }
        let inbox = self.transport.listen(&self.id).await?;
        let (storage, state_machine) = self.parts.take().ok_or(NodeError::StorageLost)?;

        // on failure the parts go back and the inbox drop releases the listener
        let last_applied = match state_machine.last_applied() {
            Ok(index) => index,
            Err(e) => {
                self.parts = Some((storage, state_machine));
                return Err(e.into());
            }
        };
        let core = match RaftNode::try_restore(
            self.id.clone(),
            self.peers.iter().cloned(),
            storage,
            self.config.clone(),
            last_applied,
        ) {
            Ok(core) => core,
            Err((e, storage)) => {
                self.parts = Some((storage, state_machine));
                return Err(e.into());
            }
        };
        self.status_tx.send_replace(core.status());

        let (control, control_rx) = mpsc::unbounded_channel();
        let actor = Actor::new(
            core,
            state_machine,
            self.transport.clone(),
            inbox,
            control_rx,
            self.status_tx.clone(),
            self.events.clone(),
        );
        let span = info_span!("raft", node = %self.id);
        let task = tokio::spawn(actor.run().instrument(span));
        self.running = Some(Running { control, task });

        info!(node = %self.id, peers = self.peers.len(), "node started");
        let _ = self.events.send(NodeEvent::Started);
        Ok(())
    }

    /// Stop the protocol and release the listener. Outstanding commands fail
    /// with `Stopped`. Storage is kept so `start` can resume from it.
    ///
    /// Returns the storage error that ended the node, if one did.
    pub async fn stop(&mut self) -> Result<(), NodeError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        // an actor that already exited has dropped its receiver
        let _ = running.control.send(Control::Stop);
        let exit = running.task.await?;
        self.parts = Some((exit.storage, exit.state_machine));

        info!(node = %self.id, "node stopped");
        let _ = self.events.send(NodeEvent::Stopped);
        exit.result.map_err(NodeError::from)
    }

    /// Add `peer` to the cluster view. Returns whether it was new; joining
    /// this node itself is ignored.
    pub fn join(&mut self, peer: impl Into<NodeId>) -> bool {
        let peer = peer.into();
        if peer == self.id || !self.peers.insert(peer.clone()) {
            return false;
        }
        if let Some(running) = &self.running {
            let _ = running.control.send(Control::Join(peer));
        }
        true
    }

    /// Replicate `command` and return its output once applied.
    ///
    /// A node that is not leader answers `NotLeader` at once, without
    /// touching the log or the network.
    pub async fn command(&self, command: Command) -> Result<CommandOutput, CommandError> {
        let Some(running) = &self.running else {
            return Err(CommandError::Stopped);
        };
        {
            let status = self.status.borrow();
            if status.role != NodeState::Leader {
                return Err(CommandError::NotLeader {
                    leader: status.leader.clone(),
                });
            }
        }
        let (respond_to, output) = oneshot::channel();
        running
            .control
            .send(Control::Command {
                command,
                respond_to,
            })
            .map_err(|_| CommandError::Stopped)?;
        output.await.map_err(|_| CommandError::Stopped)?
    }

    /// Whether the node currently holds `role`.
    pub fn is(&self, role: NodeState) -> bool {
        self.status.borrow().role == role
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Wait until the published status satisfies `condition`. Returns false
    /// when `timeout` passes first.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        condition: impl FnMut(&NodeStatus) -> bool,
    ) -> bool {
        let mut status = self.status.clone();
        let reached = tokio::time::timeout(timeout, status.wait_for(condition)).await;
        // the watch::Ref borrows `status`; release it before returning
        matches!(reached, Ok(Ok(_)))
    }
}

impl<T, S, M> Drop for Node<T, S, M> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            // dropping without stop: end the task and let it release everything
            let _ = running.control.send(Control::Stop);
        }
    }
}
