//! A single logical actor of a workload run.
//!
//! [`WorkerRunner`] walks the state machine for one worker: execute the
//! current state's handler, classify any failure against the workload's
//! `expectedErrorCodes`, sample the next state, repeat. A worker touches only
//! its own [`WorkerContext`]; everything it shares with siblings is read-only.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ErrorClass, HandlerError};
use crate::mutex::MutexCoordinator;
use crate::state_machine::{StateEnv, TransitionTable, WorkloadConfig, expected_error_codes};
use crate::store::Connection;

/// Seed used by worker `tid` for a run seeded with `run_seed`.
///
/// The tid is mixed in with a golden-ratio step and a SplitMix64 finalizer, so
/// neighbouring run seeds do not share worker seeds.
pub fn worker_seed(run_seed: u64, tid: usize) -> u64 {
    let mut z = run_seed ^ (tid as u64).wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// The RNG a worker uses to pick transitions.
pub fn transition_rng(run_seed: u64, tid: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(worker_seed(run_seed, tid))
}

/// Mutable per-worker state, owned by exactly one worker.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    tid: usize,
    seed: u64,
    iteration_count: u64,
    /// This worker's private copy of the workload data.
    pub data: Value,
    rng: ChaCha8Rng,
}

impl WorkerContext {
    pub fn new(tid: usize, data: Value, run_seed: u64) -> Self {
        let seed = worker_seed(run_seed, tid);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        // Stream 0 belongs to transition sampling.
        rng.set_stream(1);
        Self {
            tid,
            seed,
            iteration_count: 0,
            data,
            rng,
        }
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Handler invocations completed without an unexpected error.
    pub fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    /// Deterministic randomness for handler bodies.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}

/// The unexpected error that stopped a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub tid: usize,
    pub state: String,
    pub iteration: u64,
    pub code: Option<i32>,
    pub message: String,
}

/// What a worker reports back once it stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub tid: usize,
    pub seed: u64,
    pub iterations_completed: u64,
    /// Swallowed expected errors, by code.
    pub expected_errors: BTreeMap<i32, u64>,
    pub state_visits: BTreeMap<String, u64>,
    /// Visited states in order; only filled when tracing is enabled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
    /// The worker reached a terminal state before running out of iterations.
    pub stopped_at_terminal: bool,
    pub failure: Option<WorkerFailure>,
    /// Snapshot of the worker's data at completion.
    pub final_data: Value,
}

impl WorkerOutcome {
    fn new(ctx: &WorkerContext) -> Self {
        Self {
            tid: ctx.tid,
            seed: ctx.seed,
            iterations_completed: 0,
            expected_errors: BTreeMap::new(),
            state_visits: BTreeMap::new(),
            trace: Vec::new(),
            stopped_at_terminal: false,
            failure: None,
            final_data: Value::Null,
        }
    }

    /// An outcome for a worker that never got to run its state machine.
    pub fn aborted(tid: usize, seed: u64, message: impl Into<String>) -> Self {
        Self {
            tid,
            seed,
            iterations_completed: 0,
            expected_errors: BTreeMap::new(),
            state_visits: BTreeMap::new(),
            trace: Vec::new(),
            stopped_at_terminal: false,
            failure: Some(WorkerFailure {
                tid,
                state: String::new(),
                iteration: 0,
                code: None,
                message: message.into(),
            }),
            final_data: Value::Null,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn expected_error_total(&self) -> u64 {
        self.expected_errors.values().sum()
    }
}

/// Drives one worker through its iterations.
pub struct WorkerRunner<'a> {
    config: &'a WorkloadConfig,
    table: &'a TransitionTable,
    mutex: &'a MutexCoordinator,
    conn: &'a dyn Connection,
    trace_states: bool,
}

impl<'a> WorkerRunner<'a> {
    pub fn new(
        config: &'a WorkloadConfig,
        table: &'a TransitionTable,
        mutex: &'a MutexCoordinator,
        conn: &'a dyn Connection,
    ) -> Self {
        Self {
            config,
            table,
            mutex,
            conn,
            trace_states: false,
        }
    }

    /// Record every visited state in [`WorkerOutcome::trace`].
    pub fn trace_states(mut self, enabled: bool) -> Self {
        self.trace_states = enabled;
        self
    }

    /// Run the state machine to completion.
    ///
    /// - Success advances to a sampled next state.
    /// - A failure whose code is listed in `data.expectedErrorCodes` is
    ///   counted and the worker advances exactly as on success.
    /// - Any other failure, including a panic in the handler, stops this
    ///   worker and is recorded in the outcome.
    /// - Reaching a terminal state with iterations left stops the worker
    ///   without a failure.
    pub fn run<R: Rng>(&self, mut ctx: WorkerContext, rng: &mut R) -> WorkerOutcome {
        let mut outcome = WorkerOutcome::new(&ctx);
        let expected = expected_error_codes(&ctx.data);
        let env = StateEnv {
            conn: self.conn,
            resource: &self.config.resource,
            mutex: self.mutex,
        };
        let tid = ctx.tid;
        let mut current = self.table.start_state().to_string();

        for iteration in 0..self.config.iterations {
            let Some(handler) = self.config.states.get(&current) else {
                outcome.failure = Some(self.failure(tid, &current, iteration, None, "state has no handler"));
                break;
            };
            *outcome.state_visits.entry(current.clone()).or_default() += 1;
            if self.trace_states {
                outcome.trace.push(current.clone());
            }

            let result = catch_unwind(AssertUnwindSafe(|| handler.execute(&env, &mut ctx)))
                .unwrap_or_else(|panic| Err(HandlerError::failed(panic_message(panic.as_ref()))));

            if let Err(e) = result {
                let class = ErrorClass::of(&e, &expected);
                match class {
                    ErrorClass::Expected => {
                        debug!(tid, state = %current, %class, error = %e, "handler error");
                        if let Some(code) = e.code() {
                            *outcome.expected_errors.entry(code).or_default() += 1;
                        }
                    }
                    ErrorClass::Unexpected => {
                        warn!(tid, state = %current, iteration, %class, error = %e, "worker stopped on handler error");
                        outcome.failure = Some(self.failure(tid, &current, iteration, e.code(), e.to_string()));
                        break;
                    }
                }
            }
            ctx.iteration_count += 1;

            if iteration + 1 == self.config.iterations {
                break;
            }
            if self.table.is_terminal(&current) {
                debug!(tid, state = %current, "reached terminal state");
                outcome.stopped_at_terminal = true;
                break;
            }
            match self.table.next(&current, rng.random::<f64>()) {
                Ok(next) => {
                    debug!(tid, from = %current, to = %next, "transition");
                    current = next.to_string();
                }
                Err(e) => {
                    outcome.failure = Some(self.failure(tid, &current, iteration, None, e.to_string()));
                    break;
                }
            }
        }

        outcome.iterations_completed = ctx.iteration_count;
        outcome.final_data = ctx.data;
        outcome
    }

    fn failure(
        &self,
        tid: usize,
        state: &str,
        iteration: u64,
        code: Option<i32>,
        message: impl Into<String>,
    ) -> WorkerFailure {
        WorkerFailure {
            tid,
            state: state.to_string(),
            iteration,
            code,
            message: message.into(),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DUPLICATE_KEY, StoreError};
    use crate::mutex::DEFAULT_MUTEX_COLLECTION;
    use crate::state_machine::HandlerResult;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn noop(_: &StateEnv<'_>, _: &mut WorkerContext) -> HandlerResult {
        Ok(())
    }

    fn run(config: &WorkloadConfig, tid: usize, seed: u64) -> WorkerOutcome {
        let store: Arc<dyn Connection> = Arc::new(MemoryStore::new());
        let mutex = MutexCoordinator::new(store.clone(), DEFAULT_MUTEX_COLLECTION);
        let table = TransitionTable::build(config).unwrap();
        let ctx = WorkerContext::new(tid, config.data.clone(), seed);
        WorkerRunner::new(config, &table, &mutex, store.as_ref())
            .trace_states(true)
            .run(ctx, &mut transition_rng(seed, tid))
    }

    fn alternating() -> WorkloadConfig {
        WorkloadConfig::new("ab")
            .state("A", noop)
            .state("B", noop)
            .start_state("A")
            .transition("A", [("B", 1.0)])
            .transition("B", [("A", 1.0)])
            .iterations(4)
    }

    #[test]
    fn alternating_states_walk_in_order() {
        let outcome = run(&alternating(), 0, 1);
        assert_eq!(outcome.trace, vec!["A", "B", "A", "B"]);
        assert_eq!(outcome.iterations_completed, 4);
        assert!(outcome.succeeded());
        assert_eq!(outcome.state_visits["A"], 2);
    }

    #[test]
    fn fixed_seed_reproduces_state_sequence() {
        let config = WorkloadConfig::new("random")
            .state("init", noop)
            .state("x", noop)
            .state("y", noop)
            .transition("init", [("x", 1.0), ("y", 1.0)])
            .transition("x", [("init", 1.0), ("y", 2.0)])
            .transition("y", [("x", 1.0), ("init", 1.0), ("y", 1.0)])
            .iterations(200);

        let first = run(&config, 0, 42);
        let second = run(&config, 0, 42);
        assert_eq!(first.trace, second.trace);
        assert_eq!(first.trace.len(), 200);
    }

    #[test]
    fn expected_error_is_swallowed_and_state_advances() {
        let config = alternating()
            .state("A", |_, _| Err(StoreError::new(DUPLICATE_KEY, "duplicate key").into()))
            .data(json!({ "expectedErrorCodes": [DUPLICATE_KEY] }));

        let outcome = run(&config, 0, 7);
        assert!(outcome.succeeded());
        assert_eq!(outcome.trace, vec!["A", "B", "A", "B"]);
        assert_eq!(outcome.expected_errors[&DUPLICATE_KEY], 2);
        assert_eq!(outcome.iterations_completed, 4);
    }

    #[test]
    fn unexpected_error_stops_worker() {
        let config = alternating().state("B", |_, _| Err(HandlerError::coded(2, "bad value")));

        let outcome = run(&config, 3, 7);
        assert_eq!(outcome.trace, vec!["A", "B"]);
        assert_eq!(outcome.iterations_completed, 1);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.tid, 3);
        assert_eq!(failure.state, "B");
        assert_eq!(failure.iteration, 1);
        assert_eq!(failure.code, Some(2));
    }

    #[test]
    fn undeclared_code_is_unexpected_even_with_expected_list() {
        let config = alternating()
            .state("A", |_, _| Err(HandlerError::coded(13, "unauthorized")))
            .data(json!({ "expectedErrorCodes": [DUPLICATE_KEY] }));
        let outcome = run(&config, 0, 1);
        assert_eq!(outcome.failure.unwrap().code, Some(13));
    }

    #[test]
    fn panicking_handler_is_recorded_as_failure() {
        let config = alternating().state("B", |_, _| panic!("boom"));
        let outcome = run(&config, 0, 1);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.state, "B");
        assert!(failure.message.contains("boom"));
    }

    #[test]
    fn terminal_state_stops_early_without_failure() {
        let config = WorkloadConfig::new("finite")
            .state("init", noop)
            .state("done", noop)
            .transition("init", [("done", 1.0)])
            .terminal("done")
            .iterations(10);

        let outcome = run(&config, 0, 1);
        assert!(outcome.succeeded());
        assert!(outcome.stopped_at_terminal);
        assert_eq!(outcome.trace, vec!["init", "done"]);
        assert_eq!(outcome.iterations_completed, 2);
    }

    #[test]
    fn handlers_mutate_only_their_own_data() {
        let config = alternating()
            .state("A", |_, ctx: &mut WorkerContext| {
                let n = ctx.data["count"].as_u64().unwrap_or(0);
                ctx.data["count"] = json!(n + 1);
                ctx.data["tid"] = json!(ctx.tid());
                Ok(())
            })
            .data(json!({ "count": 0 }));

        let outcome = run(&config, 5, 1);
        assert_eq!(outcome.final_data, json!({ "count": 2, "tid": 5 }));
        assert_eq!(config.data, json!({ "count": 0 }));
    }

    #[test]
    fn worker_seeds_differ_by_tid() {
        let seeds: std::collections::HashSet<u64> = (0..64).map(|tid| worker_seed(100, tid)).collect();
        assert_eq!(seeds.len(), 64);
        assert_eq!(worker_seed(100, 3), worker_seed(100, 3));
        let ctx = WorkerContext::new(2, json!({}), 10);
        assert_eq!(ctx.seed(), worker_seed(10, 2));
        assert_eq!(ctx.tid(), 2);
        assert_eq!(ctx.iteration_count(), 0);
    }

    #[test]
    fn adjacent_run_seeds_do_not_share_worker_seeds() {
        for run_seed in [0, 1, 41, 1 << 40, u64::MAX - 1] {
            for tid in 1..16 {
                assert_ne!(worker_seed(run_seed, tid), worker_seed(run_seed + 1, tid - 1));
                assert_ne!(worker_seed(run_seed, tid), worker_seed(run_seed.wrapping_add(tid as u64), 0));
            }
        }
    }
}
