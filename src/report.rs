use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::WorkloadConfig;
use crate::worker::{WorkerFailure, WorkerOutcome};

/// Lifecycle phases of a workload run.
///
/// A run flows through: INIT → SETUP → RUNNING → TEARDOWN → DONE. A failed
/// setup skips RUNNING, still tears down, and ends in FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Init,
    Setup,
    Running,
    Teardown,
    Done,
    Failed,
    Skipped,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Init => write!(f, "INIT"),
            RunPhase::Setup => write!(f, "SETUP"),
            RunPhase::Running => write!(f, "RUNNING"),
            RunPhase::Teardown => write!(f, "TEARDOWN"),
            RunPhase::Done => write!(f, "DONE"),
            RunPhase::Failed => write!(f, "FAILED"),
            RunPhase::Skipped => write!(f, "SKIPPED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Done,
    Failed,
    Skipped,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Done => write!(f, "DONE"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Identical failure messages and the workers that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureGroup {
    pub message: String,
    pub tids: Vec<usize>,
}

/// Result of one workload run, finalized after teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub workload: String,
    pub seed: u64,
    pub thread_count: usize,
    pub iterations: u64,
    pub status: RunStatus,
    pub phases: Vec<RunPhase>,
    pub skip_reason: Option<String>,
    pub setup_error: Option<String>,
    pub teardown_error: Option<String>,
    pub workers: Vec<WorkerOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl RunReport {
    pub(crate) fn begin(config: &WorkloadConfig, seed: u64) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            workload: config.name.clone(),
            seed,
            thread_count: config.thread_count,
            iterations: config.iterations,
            status: RunStatus::Done,
            phases: vec![RunPhase::Init],
            skip_reason: None,
            setup_error: None,
            teardown_error: None,
            workers: Vec::new(),
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    pub(crate) fn enter(&mut self, phase: RunPhase) {
        self.phases.push(phase);
    }

    pub(crate) fn record(&mut self, outcome: WorkerOutcome) {
        self.workers.push(outcome);
    }

    /// Compute the final status and close the phase history.
    ///
    /// Status is FAILED iff setup failed or a worker stopped on an unexpected
    /// error. A teardown failure is kept in `teardown_error` only.
    pub(crate) fn finish(mut self) -> Self {
        self.workers.sort_by_key(|w| w.tid);
        self.status = if self.skip_reason.is_some() {
            RunStatus::Skipped
        } else if self.setup_error.is_some() || self.workers.iter().any(|w| !w.succeeded()) {
            RunStatus::Failed
        } else {
            RunStatus::Done
        };
        self.phases.push(match self.status {
            RunStatus::Done => RunPhase::Done,
            RunStatus::Failed => RunPhase::Failed,
            RunStatus::Skipped => RunPhase::Skipped,
        });
        self.completed_at = Utc::now();
        self.duration_ms = (self.completed_at - self.started_at).num_milliseconds();
        self
    }

    /// Every worker failure, in tid order.
    pub fn failures(&self) -> Vec<&WorkerFailure> {
        self.workers.iter().filter_map(|w| w.failure.as_ref()).collect()
    }

    /// Failures grouped by message, so a bug hit by every worker is listed once.
    pub fn grouped_failures(&self) -> Vec<FailureGroup> {
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for failure in self.failures() {
            groups.entry(failure.message.as_str()).or_default().push(failure.tid);
        }
        groups
            .into_iter()
            .map(|(message, tids)| FailureGroup {
                message: message.to_string(),
                tids,
            })
            .collect()
    }

    pub fn total_iterations(&self) -> u64 {
        self.workers.iter().map(|w| w.iterations_completed).sum()
    }

    pub fn expected_error_count(&self) -> u64 {
        self.workers.iter().map(WorkerOutcome::expected_error_total).sum()
    }

    /// Visits per state summed over all workers.
    pub fn state_visits(&self) -> BTreeMap<String, u64> {
        let mut visits = BTreeMap::new();
        for worker in &self.workers {
            for (state, n) in &worker.state_visits {
                *visits.entry(state.clone()).or_default() += n;
            }
        }
        visits
    }

    /// DONE with a clean teardown.
    pub fn is_clean(&self) -> bool {
        self.status == RunStatus::Done && self.teardown_error.is_none()
    }
}
