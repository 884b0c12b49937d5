//! Finite-state-machine driven concurrent workload executor.
//!
//! A workload is a set of named states with handlers, a weighted transition
//! graph between them, and optional setup/teardown hooks. The
//! [`Orchestrator`] validates it, runs setup, walks the state machine on
//! `thread_count` worker threads against a shared [`Connection`], tears down,
//! and returns a [`RunReport`].

pub mod config;
pub mod error;
pub mod mutex;
pub mod orchestrator;
pub mod report;
pub mod state_machine;
pub mod store;
pub mod ui;
pub mod worker;
pub mod workloads;

pub use config::EngineConfig;
pub use error::{ConfigError, ErrorClass, HandlerError, StoreError};
pub use mutex::{MutexCoordinator, MutexGuard};
pub use orchestrator::{Orchestrator, RunOptions};
pub use report::{FailureGroup, RunPhase, RunReport, RunStatus};
pub use state_machine::{
    HandlerResult, PhaseEnv, StateEnv, StateHandler, TransitionTable, WorkloadConfig,
    WorkloadOverrides, compose,
};
pub use store::{ClusterHandle, Connection, Document, MemoryStore, SingleNode};
pub use worker::{WorkerContext, WorkerFailure, WorkerOutcome, WorkerRunner};
