//! # comprehensive node tests
//!
//! why: verify live clusters behave correctly end to end
//! relations: tests raft-node over raft-storage engines and both transports
//! what: lifecycle, election, command path, recovery, partitions, fatal storage, tcp

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use raft_core::{LogEntry, MemLogStorage, StateMachine, StorageError};
use raft_node::{
    Command, CommandError, CommandOutput, MemoryRouter, Node, NodeError, NodeEvent, NodeState,
    RaftConfig, TcpTransport, Transport,
};
use raft_storage::{EngineLogStorage, KvStateMachine, MemoryEngine};
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};

type KvNode<T> = Node<T, EngineLogStorage<MemoryEngine>, KvStateMachine<MemoryEngine>>;

const SETTLE: Duration = Duration::from_secs(5);

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn test_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: 150,
        election_timeout_max: 300,
        heartbeat_interval: 30,
        rpc_timeout: 50,
        ..RaftConfig::default()
    }
}

fn build<T: Transport>(name: &str, transport: T, engine: &MemoryEngine) -> KvNode<T> {
    Node::new(
        name,
        test_config(),
        transport,
        EngineLogStorage::open(engine.clone()).unwrap(),
        KvStateMachine::open(engine.clone()).unwrap(),
    )
    .unwrap()
}

async fn next_event(
    events: &mut broadcast::Receiver<NodeEvent>,
    wanted: impl Fn(&NodeEvent) -> bool,
) -> NodeEvent {
    timeout(SETTLE, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event did not arrive")
}

struct Cluster<T: Transport> {
    transport: T,
    names: Vec<String>,
    engines: Vec<MemoryEngine>,
    nodes: Vec<KvNode<T>>,
}

impl<T: Transport> Cluster<T> {
    /// Start every node, then join each to the others.
    async fn launch(transport: T, names: &[&str]) -> Self {
        init_tracing();
        let engines: Vec<MemoryEngine> = names.iter().map(|_| MemoryEngine::new()).collect();
        let mut nodes: Vec<KvNode<T>> = names
            .iter()
            .zip(&engines)
            .map(|(name, engine)| build(name, transport.clone(), engine))
            .collect();
        for node in &mut nodes {
            node.start().await.unwrap();
        }
        for node in &mut nodes {
            for peer in names {
                node.join(*peer);
            }
        }
        Self {
            transport,
            names: names.iter().map(|n| n.to_string()).collect(),
            engines,
            nodes,
        }
    }

    fn others(&self, skip: usize) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&i| i != skip).collect()
    }

    /// Wait until exactly one of `among` leads and the rest follow it in the same term.
    async fn wait_for_leader(&self, among: &[usize]) -> usize {
        let deadline = Instant::now() + SETTLE;
        loop {
            let leaders: Vec<usize> = among
                .iter()
                .copied()
                .filter(|&i| self.nodes[i].is(NodeState::Leader))
                .collect();
            if let [leader] = leaders[..] {
                let term = self.nodes[leader].status().term;
                let settled = among.iter().all(|&i| {
                    i == leader || {
                        let status = self.nodes[i].status();
                        status.role == NodeState::Follower && status.term == term
                    }
                });
                if settled {
                    return leader;
                }
            }
            assert!(Instant::now() < deadline, "no stable leader among {among:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn value_on(&self, node: usize, key: &str) -> Option<String> {
        KvStateMachine::open(self.engines[node].clone())
            .unwrap()
            .get(key)
            .unwrap()
    }
}

// =============================================================================
// SECTION 1: LIFECYCLE
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = RaftConfig {
            heartbeat_interval: 500,
            ..RaftConfig::default()
        };
        let engine = MemoryEngine::new();
        let result = Node::new(
            "a",
            config,
            MemoryRouter::new(),
            EngineLogStorage::open(engine.clone()).unwrap(),
            KvStateMachine::open(engine).unwrap(),
        );
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let mut node = build("a", MemoryRouter::new(), &MemoryEngine::new());
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(NodeError::AlreadyRunning)));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_releases_the_listener_and_is_idempotent() {
        let router = MemoryRouter::new();
        let mut node = build("a", router.clone(), &MemoryEngine::new());
        node.start().await.unwrap();
        assert!(router.is_listening(node.id()));

        node.stop().await.unwrap();
        assert!(!router.is_listening(node.id()));
        assert!(!node.is_running());
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn address_already_in_use_fails_start() {
        let router = MemoryRouter::new();
        let mut first = build("a", router.clone(), &MemoryEngine::new());
        let mut second = build("a", router, &MemoryEngine::new());
        first.start().await.unwrap();

        let err = second.start().await.unwrap_err();
        assert!(matches!(err, NodeError::Transport(_)));
        // the failed start kept its storage
        first.stop().await.unwrap();
        second.start().await.unwrap();
        second.stop().await.unwrap();
    }

    /// Wraps a KV state machine whose first `last_applied` read fails.
    struct FlakyOnOpen {
        inner: KvStateMachine<MemoryEngine>,
        fail_next: AtomicBool,
    }

    impl StateMachine for FlakyOnOpen {
        fn last_applied(&self) -> Result<u64, StorageError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StorageError::Corrupt("transient read failure".to_string()));
            }
            self.inner.last_applied()
        }

        fn apply(&mut self, entry: &LogEntry) -> Result<CommandOutput, StorageError> {
            self.inner.apply(entry)
        }
    }

    #[tokio::test]
    async fn failed_start_keeps_storage_for_a_retry() {
        let router = MemoryRouter::new();
        let engine = MemoryEngine::new();
        let mut node = Node::new(
            "a",
            test_config(),
            router.clone(),
            EngineLogStorage::open(engine.clone()).unwrap(),
            FlakyOnOpen {
                inner: KvStateMachine::open(engine).unwrap(),
                fail_next: AtomicBool::new(true),
            },
        )
        .unwrap();

        let err = node.start().await.unwrap_err();
        assert!(matches!(err, NodeError::Storage(StorageError::Corrupt(_))));
        assert!(!node.is_running());
        assert!(!router.is_listening(node.id()));

        node.start().await.unwrap();
        assert!(node.wait_for(SETTLE, |s| s.role == NodeState::Leader).await);
        assert_eq!(
            node.command(Command::put("k", "v")).await.unwrap(),
            CommandOutput::Written
        );
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn command_on_stopped_node_reports_stopped() {
        let node = build("a", MemoryRouter::new(), &MemoryEngine::new());
        let err = node.command(Command::put("k", "v")).await.unwrap_err();
        assert_eq!(err, CommandError::Stopped);
        assert_eq!(err.code(), "ESTOPPED");
    }

    #[tokio::test]
    async fn join_is_idempotent_and_ignores_self() {
        let mut node = build("a", MemoryRouter::new(), &MemoryEngine::new());
        assert!(node.join("b"));
        assert!(!node.join("b"));
        assert!(!node.join("a"));
        assert_eq!(node.peers().count(), 1);
    }

    #[tokio::test]
    async fn events_report_start_role_change_and_stop() {
        let mut node = build("a", MemoryRouter::new(), &MemoryEngine::new());
        let mut events = node.subscribe();

        node.start().await.unwrap();
        assert_eq!(next_event(&mut events, |_| true).await, NodeEvent::Started);

        let change = next_event(&mut events, |e| matches!(e, NodeEvent::RoleChanged { .. })).await;
        // alone in its cluster view, the node wins its first election outright
        assert_eq!(
            change,
            NodeEvent::RoleChanged {
                from: NodeState::Follower,
                to: NodeState::Leader,
                term: 1
            }
        );

        node.stop().await.unwrap();
        assert_eq!(
            next_event(&mut events, |e| *e == NodeEvent::Stopped).await,
            NodeEvent::Stopped
        );
        assert!(node.is(NodeState::Follower));
    }
}

// =============================================================================
// SECTION 2: SINGLE NODE
// =============================================================================

mod single_node {
    use super::*;

    async fn started(engine: &MemoryEngine) -> KvNode<MemoryRouter> {
        init_tracing();
        let mut node = build("solo", MemoryRouter::new(), engine);
        node.start().await.unwrap();
        assert!(node.wait_for(SETTLE, |s| s.role == NodeState::Leader).await);
        node
    }

    #[tokio::test]
    async fn serves_put_and_get() {
        let node = started(&MemoryEngine::new()).await;

        let put = node.command(Command::put("a", "1")).await.unwrap();
        let get = node.command(Command::get("a")).await.unwrap();

        assert_eq!(put, CommandOutput::Written);
        assert_eq!(get.value(), Some("1"));
    }

    #[tokio::test]
    async fn restart_resumes_from_storage() {
        let engine = MemoryEngine::new();
        let mut node = started(&engine).await;
        node.command(Command::put("k", "v")).await.unwrap();
        let before = node.status();
        node.stop().await.unwrap();

        node.start().await.unwrap();
        assert!(node.wait_for(SETTLE, |s| s.role == NodeState::Leader).await);
        let after = node.status();
        assert!(after.term > before.term);
        assert!(after.last_log_index > before.last_log_index);
        assert_eq!(
            node.command(Command::get("k")).await.unwrap().value(),
            Some("v")
        );
    }

    #[tokio::test]
    async fn status_already_shows_a_command_when_it_returns() {
        let node = started(&MemoryEngine::new()).await;

        for i in 0..10 {
            node.command(Command::put(format!("k{i}"), "v")).await.unwrap();
            let status = node.status();
            assert_eq!(status.last_applied, status.last_log_index);
            assert_eq!(status.commit_index, status.last_log_index);
        }
    }

    #[tokio::test]
    async fn get_of_missing_key_is_none() {
        let node = started(&MemoryEngine::new()).await;
        let output = node.command(Command::get("ghost")).await.unwrap();
        assert_eq!(output, CommandOutput::Value(None));
    }
}

// =============================================================================
// SECTION 3: THREE NODE CLUSTER
// =============================================================================

mod three_nodes {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn elects_one_leader_and_serves_commands() {
        let cluster = Cluster::launch(MemoryRouter::new(), &["a", "b", "c"]).await;
        let leader = cluster.wait_for_leader(&[0, 1, 2]).await;
        let followers = cluster.others(leader);

        assert!(cluster.nodes[leader].is(NodeState::Leader));
        for &f in &followers {
            assert!(cluster.nodes[f].is(NodeState::Follower));
        }

        let put = cluster.nodes[leader]
            .command(Command::put("a", "1"))
            .await
            .unwrap();
        assert_eq!(put, CommandOutput::Written);
        let get = cluster.nodes[leader].command(Command::get("a")).await.unwrap();
        assert_eq!(get.value(), Some("1"));

        let err = cluster.nodes[followers[0]]
            .command(Command::put("b", "2"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ENOTLEADER");
        assert_eq!(err.to_string(), "not the leader");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn follower_rejection_leaves_state_untouched() {
        let cluster = Cluster::launch(MemoryRouter::new(), &["a", "b", "c"]).await;
        let leader = cluster.wait_for_leader(&[0, 1, 2]).await;
        let follower = cluster.others(leader)[0];
        let before = cluster.nodes[follower].status();

        let err = cluster.nodes[follower]
            .command(Command::put("x", "1"))
            .await
            .unwrap_err();

        let leader_id = cluster.nodes[leader].id().clone();
        assert!(matches!(err, CommandError::NotLeader { leader: Some(ref l) } if *l == leader_id));
        let after = cluster.nodes[follower].status();
        assert_eq!(after.last_log_index, before.last_log_index);
        assert_eq!(after.term, before.term);
        assert_eq!(cluster.value_on(follower, "x"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commands_resolve_independently() {
        let cluster = Cluster::launch(MemoryRouter::new(), &["a", "b", "c"]).await;
        let leader = &cluster.nodes[cluster.wait_for_leader(&[0, 1, 2]).await];

        let (first, second, read) = tokio::join!(
            leader.command(Command::put("a", "1")),
            leader.command(Command::put("b", "2")),
            leader.command(Command::get("a")),
        );

        assert_eq!(first.unwrap(), CommandOutput::Written);
        assert_eq!(second.unwrap(), CommandOutput::Written);
        assert_eq!(read.unwrap().value(), Some("1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn followers_converge_on_the_leader_state() {
        let cluster = Cluster::launch(MemoryRouter::new(), &["a", "b", "c"]).await;
        let leader = cluster.wait_for_leader(&[0, 1, 2]).await;
        for i in 0..5 {
            cluster.nodes[leader]
                .command(Command::put(format!("k{i}"), format!("v{i}")))
                .await
                .unwrap();
        }
        let target = cluster.nodes[leader].status().last_applied;

        for f in cluster.others(leader) {
            assert!(
                cluster.nodes[f]
                    .wait_for(SETTLE, |s| s.last_applied >= target)
                    .await
            );
            assert_eq!(cluster.value_on(f, "k4").as_deref(), Some("v4"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peers_joined_before_start_form_a_cluster() {
        init_tracing();
        let router = MemoryRouter::new();
        let names = ["a", "b", "c"];
        let mut nodes: Vec<KvNode<MemoryRouter>> = names
            .iter()
            .map(|n| build(n, router.clone(), &MemoryEngine::new()))
            .collect();
        for node in &mut nodes {
            for peer in names {
                node.join(peer);
            }
            node.start().await.unwrap();
        }

        let deadline = Instant::now() + SETTLE;
        let leader = loop {
            if let Some(leader) = nodes.iter().find(|n| n.is(NodeState::Leader)) {
                break leader;
            }
            assert!(Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(
            leader.command(Command::put("k", "v")).await.unwrap(),
            CommandOutput::Written
        );
    }
}

// =============================================================================
// SECTION 4: RECOVERY
// =============================================================================

mod recovery {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn majority_continues_after_leader_stops_and_old_leader_catches_up() {
        let mut cluster = Cluster::launch(MemoryRouter::new(), &["a", "b", "c"]).await;
        let old = cluster.wait_for_leader(&[0, 1, 2]).await;
        cluster.nodes[old]
            .command(Command::put("k", "v1"))
            .await
            .unwrap();

        cluster.nodes[old].stop().await.unwrap();
        let rest = cluster.others(old);
        let new = cluster.wait_for_leader(&rest).await;
        assert_ne!(new, old);
        cluster.nodes[new]
            .command(Command::put("k", "v2"))
            .await
            .unwrap();
        let target = cluster.nodes[new].status().last_applied;

        cluster.nodes[old].start().await.unwrap();
        assert!(
            cluster.nodes[old]
                .wait_for(SETTLE, |s| s.last_applied >= target)
                .await
        );
        assert_eq!(cluster.value_on(old, "k").as_deref(), Some("v2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn whole_cluster_restarts_from_durable_state() {
        let mut cluster = Cluster::launch(MemoryRouter::new(), &["a", "b", "c"]).await;
        let leader = cluster.wait_for_leader(&[0, 1, 2]).await;
        cluster.nodes[leader]
            .command(Command::put("durable", "yes"))
            .await
            .unwrap();
        for node in &mut cluster.nodes {
            node.stop().await.unwrap();
        }

        // fresh handles over the same engines, as after a process restart
        let mut restarted: Vec<KvNode<MemoryRouter>> = Vec::new();
        for (name, engine) in cluster.names.iter().zip(&cluster.engines) {
            let mut node = build(name, cluster.transport.clone(), engine);
            for peer in &cluster.names {
                node.join(peer.as_str());
            }
            node.start().await.unwrap();
            restarted.push(node);
        }
        let cluster = Cluster {
            nodes: restarted,
            ..cluster
        };

        let leader = cluster.wait_for_leader(&[0, 1, 2]).await;
        let read = cluster.nodes[leader]
            .command(Command::get("durable"))
            .await
            .unwrap();
        assert_eq!(read.value(), Some("yes"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn partitioned_leader_fails_its_pending_command() {
        let cluster = Cluster::launch(MemoryRouter::new(), &["a", "b", "c"]).await;
        let old = cluster.wait_for_leader(&[0, 1, 2]).await;
        cluster.nodes[old]
            .command(Command::put("x", "1"))
            .await
            .unwrap();

        cluster.transport.isolate(cluster.nodes[old].id());
        let rest = cluster.others(old);
        let (lost, new) = tokio::join!(
            cluster.nodes[old].command(Command::put("x", "lost")),
            async {
                let new = cluster.wait_for_leader(&rest).await;
                cluster.transport.heal_all();
                new
            }
        );

        assert_eq!(lost.unwrap_err().code(), "ENOTLEADER");
        let read = cluster.nodes[new].command(Command::get("x")).await.unwrap();
        assert_eq!(read.value(), Some("1"));
        assert!(
            cluster.nodes[old]
                .wait_for(SETTLE, |s| s.role == NodeState::Follower)
                .await
        );
    }
}

// =============================================================================
// SECTION 5: STORAGE FAILURE
// =============================================================================

mod storage_failure {
    use super::*;

    /// A state machine whose disk refuses every write.
    struct BrokenDisk;

    impl StateMachine for BrokenDisk {
        fn last_applied(&self) -> Result<u64, StorageError> {
            Ok(0)
        }

        fn apply(&mut self, _entry: &LogEntry) -> Result<CommandOutput, StorageError> {
            Err(StorageError::Corrupt("disk refused write".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_apply_is_fatal() {
        init_tracing();
        let mut node = Node::new(
            "a",
            test_config(),
            MemoryRouter::new(),
            MemLogStorage::new(),
            BrokenDisk,
        )
        .unwrap();
        let mut events = node.subscribe();
        node.start().await.unwrap();

        // the leader no-op is the first entry to apply
        let fatal = next_event(&mut events, |e| matches!(e, NodeEvent::Fatal(_))).await;
        assert!(matches!(fatal, NodeEvent::Fatal(ref msg) if msg.contains("disk refused write")));

        let stopped = node.stop().await;
        assert!(matches!(stopped, Err(NodeError::Storage(_))));
        assert_eq!(
            node.command(Command::put("k", "v")).await.unwrap_err(),
            CommandError::Stopped
        );
    }
}

// =============================================================================
// SECTION 6: TCP TRANSPORT
// =============================================================================

mod tcp {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cluster_over_loopback() {
        let cluster = Cluster::launch(
            TcpTransport::new(),
            &["127.0.0.1:47421", "127.0.0.1:47422", "127.0.0.1:47423"],
        )
        .await;
        let leader = cluster.wait_for_leader(&[0, 1, 2]).await;

        cluster.nodes[leader]
            .command(Command::put("net", "ok"))
            .await
            .unwrap();
        let read = cluster.nodes[leader].command(Command::get("net")).await.unwrap();
        assert_eq!(read.value(), Some("ok"));

        let follower = cluster.others(leader)[0];
        let err = cluster.nodes[follower]
            .command(Command::get("net"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ENOTLEADER");
    }
}
