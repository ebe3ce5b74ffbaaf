//! # raft-storage
//!
//! why: provide durable persistence for raft state and the replicated key-value map
//! relations: implements the LogStorage and StateMachine traits of raft-core, used by raft-node
//! what: KvEngine with memory and file engines, EngineLogStorage, KvStateMachine

pub mod engine;
pub mod log_store;
pub mod state_machine;

pub use engine::{BatchOp, FileEngine, KvEngine, MemoryEngine};
pub use log_store::EngineLogStorage;
pub use state_machine::KvStateMachine;
