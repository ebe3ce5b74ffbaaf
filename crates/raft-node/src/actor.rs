//! # actor
//!
//! why: one task owns a node's protocol state, so no locks guard it
//! relations: spawned by node.rs; drives raft_core::RaftNode, apply.rs, timer.rs and a Transport
//! what: Control messages, the select loop, outbound rpc bookkeeping, role change side effects

use std::collections::HashSet;
use std::sync::Arc;

use raft_core::{
    AppendSent, Command, LogStorage, NodeId, NodeState, NodeStatus, RaftError, RaftMessage,
    RaftNode, RaftReply, ReplicationOutcome, StateMachine, StorageError,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::apply::{apply_committed, PendingCommands, Responder};
use crate::error::{CommandError, TransportError};
use crate::event::NodeEvent;
use crate::timer::ElectionTimer;
use crate::transport::{Inbox, InboundRpc, Transport};

/// Requests from the Node handle.
#[derive(Debug)]
pub(crate) enum Control {
    Command {
        command: Command,
        respond_to: Responder,
    },
    Join(NodeId),
    Stop,
}

/// What an outbound rpc was, so its reply can be matched up.
#[derive(Debug, Clone, Copy)]
enum Sent {
    Vote,
    Append(AppendSent),
}

#[derive(Debug)]
struct PeerReply {
    peer: NodeId,
    sent_term: u64,
    sent: Sent,
    reply: Result<RaftReply, TransportError>,
}

/// Everything the actor hands back when it exits, so the node can restart.
pub(crate) struct ActorExit<S, M> {
    pub(crate) storage: S,
    pub(crate) state_machine: M,
    pub(crate) result: Result<(), StorageError>,
}

pub(crate) struct Actor<S, M, T> {
    core: RaftNode<S>,
    state_machine: M,
    transport: T,
    inbox: Inbox,
    control: mpsc::UnboundedReceiver<Control>,
    rpcs: JoinSet<PeerReply>,
    /// Peers with an AppendEntries outstanding
    in_flight: HashSet<NodeId>,
    timer: ElectionTimer,
    heartbeat: Interval,
    pending: PendingCommands,
    role: NodeState,
    status: Arc<watch::Sender<NodeStatus>>,
    events: broadcast::Sender<NodeEvent>,
}

impl<S, M, T> Actor<S, M, T>
where
    S: LogStorage,
    M: StateMachine,
    T: Transport,
{
    pub(crate) fn new(
        core: RaftNode<S>,
        state_machine: M,
        transport: T,
        inbox: Inbox,
        control: mpsc::UnboundedReceiver<Control>,
        status: Arc<watch::Sender<NodeStatus>>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        let config = core.config().clone();
        let mut heartbeat = time::interval(config.heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            role: core.state(),
            core,
            state_machine,
            transport,
            inbox,
            control,
            rpcs: JoinSet::new(),
            in_flight: HashSet::new(),
            timer: ElectionTimer::new(config),
            heartbeat,
            pending: PendingCommands::default(),
            status,
            events,
        }
    }

    pub(crate) async fn run(mut self) -> ActorExit<S, M> {
        info!(
            term = self.core.current_term(),
            last_log_index = self.core.last_log_index(),
            last_applied = self.core.last_applied(),
            "raft actor started"
        );
        let result = self.drive().await;

        let failure = match &result {
            Ok(()) => CommandError::Stopped,
            Err(e) => {
                error!(error = %e, "storage failure, node stopping");
                let _ = self.events.send(NodeEvent::Fatal(e.to_string()));
                CommandError::Fatal(e.to_string())
            }
        };
        debug!(pending = self.pending.len(), "failing outstanding commands");
        self.pending.fail_all(&failure);

        let mut status = self.core.status();
        status.role = NodeState::Follower;
        status.leader = None;
        self.status.send_replace(status);
        info!("raft actor stopped");

        // inbox, timers and in-flight rpcs are dropped here
        ActorExit {
            storage: self.core.into_storage(),
            state_machine: self.state_machine,
            result,
        }
    }

    async fn drive(&mut self) -> Result<(), StorageError> {
        self.after_step()?;
        loop {
            tokio::select! {
                control = self.control.recv() => match control {
                    Some(Control::Stop) | None => return Ok(()),
                    Some(control) => self.on_control(control)?,
                },
                Some(rpc) = self.inbox.recv() => self.on_inbound(rpc)?,
                Some(joined) = self.rpcs.join_next() => match joined {
                    Ok(reply) => self.on_reply(reply)?,
                    Err(e) => warn!(error = %e, "rpc task failed"),
                },
                _ = self.timer.fired() => self.on_election_timeout()?,
                _ = self.heartbeat.tick(), if self.core.is_leader() => self.replicate_all(),
            }
            self.after_step()?;
        }
    }

    fn on_control(&mut self, control: Control) -> Result<(), StorageError> {
        match control {
            Control::Command {
                command,
                respond_to,
            } => match self.core.propose(command) {
                Ok((index, term)) => {
                    self.pending.insert(index, term, respond_to);
                    self.replicate_all();
                }
                Err(RaftError::NotLeader { leader }) => {
                    let _ = respond_to.send(Err(CommandError::NotLeader { leader }));
                }
                Err(RaftError::Storage(e)) => {
                    let _ = respond_to.send(Err(CommandError::Fatal(e.to_string())));
                    return Err(e);
                }
            },
            Control::Join(peer) => {
                if self.core.add_peer(peer.clone()) {
                    info!(%peer, cluster_size = self.core.cluster_size(), "peer joined");
                    self.send_append(&peer);
                }
            }
            Control::Stop => {}
        }
        Ok(())
    }

    fn on_inbound(&mut self, rpc: InboundRpc) -> Result<(), StorageError> {
        let InboundRpc {
            message,
            respond_to,
        } = rpc;
        let reply = match message {
            RaftMessage::RequestVote(request) => {
                let (response, reset) = self.core.handle_vote_request(&request)?;
                if reset {
                    self.timer.reset();
                }
                RaftReply::RequestVote(response)
            }
            RaftMessage::AppendEntries(request) => {
                let (response, reset) = self.core.handle_append_entries(&request)?;
                if reset {
                    self.timer.reset();
                }
                RaftReply::AppendEntries(response)
            }
        };
        // storage writes above finished before the reply leaves
        let _ = respond_to.send(reply);
        Ok(())
    }

    fn on_reply(&mut self, reply: PeerReply) -> Result<(), StorageError> {
        let PeerReply {
            peer,
            sent_term,
            sent,
            reply,
        } = reply;
        if matches!(sent, Sent::Append(_)) && sent_term == self.core.current_term() {
            self.in_flight.remove(&peer);
        }

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                debug!(%peer, error = %e, "rpc failed");
                return Ok(());
            }
        };
        match (sent, reply) {
            (Sent::Vote, RaftReply::RequestVote(response)) => {
                self.core.handle_vote_response(&peer, sent_term, &response)?;
            }
            (Sent::Append(sent), RaftReply::AppendEntries(response)) => {
                let outcome = self
                    .core
                    .handle_append_entries_response(&peer, sent, &response)?;
                match outcome {
                    ReplicationOutcome::Accepted {
                        caught_up: false, ..
                    }
                    | ReplicationOutcome::Rejected => self.send_append(&peer),
                    ReplicationOutcome::Accepted { .. }
                    | ReplicationOutcome::SteppedDown
                    | ReplicationOutcome::Stale => {}
                }
            }
            (_, other) => {
                warn!(%peer, reply = ?other, "reply does not match request");
                let _ = self.events.send(NodeEvent::Warning(format!(
                    "mismatched reply from {peer}"
                )));
            }
        }
        Ok(())
    }

    fn on_election_timeout(&mut self) -> Result<(), StorageError> {
        if self.core.is_leader() {
            return Ok(());
        }
        let request = self.core.start_election()?;
        self.timer.reset();
        let peers: Vec<NodeId> = self.core.peer_ids().cloned().collect();
        for peer in peers {
            self.dispatch(peer, RaftMessage::RequestVote(request.clone()), Sent::Vote);
        }
        Ok(())
    }

    fn replicate_all(&mut self) {
        let peers: Vec<NodeId> = self.core.peer_ids().cloned().collect();
        for peer in peers {
            self.send_append(&peer);
        }
    }

    fn send_append(&mut self, peer: &NodeId) {
        if self.in_flight.contains(peer) {
            return;
        }
        let Some(request) = self.core.append_request_for(peer) else {
            return;
        };
        self.in_flight.insert(peer.clone());
        let sent = Sent::Append(request.sent());
        self.dispatch(peer.clone(), RaftMessage::AppendEntries(request), sent);
    }

    fn dispatch(&mut self, peer: NodeId, message: RaftMessage, sent: Sent) {
        let transport = self.transport.clone();
        let deadline = self.core.config().rpc_deadline();
        let sent_term = message.term();
        self.rpcs.spawn(async move {
            let reply = match time::timeout(deadline, transport.send(&peer, message)).await {
                Ok(reply) => reply,
                Err(_) => Err(TransportError::Timeout),
            };
            PeerReply {
                peer,
                sent_term,
                sent,
                reply,
            }
        });
    }

    fn after_step(&mut self) -> Result<(), StorageError> {
        self.observe_role();
        let mut applied = Vec::new();
        let result = apply_committed(&mut self.core, &mut self.state_machine, &mut applied);
        // publish first, so a client that gets its answer also sees it in status()
        self.status.send_replace(self.core.status());
        for output in applied {
            self.pending.resolve(output);
        }
        result
    }

    fn observe_role(&mut self) {
        let role = self.core.state();
        if role == self.role {
            return;
        }
        let from = std::mem::replace(&mut self.role, role);
        let term = self.core.current_term();
        info!(%from, to = %role, term, "role changed");
        let _ = self.events.send(NodeEvent::RoleChanged { from, to: role, term });

        if from == NodeState::Leader {
            self.pending.fail_all(&CommandError::NotLeader {
                leader: self.core.leader().cloned(),
            });
            self.timer.reset();
        }
        if role == NodeState::Leader {
            self.timer.cancel();
            self.in_flight.clear();
            self.heartbeat.reset();
            self.replicate_all();
        } else if !self.timer.is_armed() {
            self.timer.reset();
        }
    }
}
