use std::sync::{Arc, Condvar, Mutex, PoisonError};

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{ConfigError, HandlerError};
use crate::mutex::{DEFAULT_MUTEX_COLLECTION, MutexCoordinator};
use crate::report::{RunPhase, RunReport};
use crate::state_machine::{PhaseEnv, PhaseHook, TransitionTable, WorkloadConfig};
use crate::store::{ClusterHandle, Connection};
use crate::worker::{WorkerContext, WorkerOutcome, WorkerRunner, transition_rng, worker_seed};

/// Per-run engine settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub seed: Option<u64>,
    pub mutex_collection: String,
    pub start_barrier: bool,
    pub trace_states: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            seed: None,
            mutex_collection: DEFAULT_MUTEX_COLLECTION.to_string(),
            start_barrier: true,
            trace_states: false,
        }
    }
}

impl From<&EngineConfig> for RunOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            seed: config.seed,
            mutex_collection: config.mutex_collection.clone(),
            start_barrier: config.start_barrier,
            trace_states: config.trace_states,
        }
    }
}

type PhaseObserver = Arc<dyn Fn(RunPhase) + Send + Sync>;

/// Drives workloads through setup, the parallel phase and teardown.
pub struct Orchestrator {
    conn: Arc<dyn Connection>,
    cluster: Arc<dyn ClusterHandle>,
    options: RunOptions,
    observer: Option<PhaseObserver>,
}

impl Orchestrator {
    pub fn new(conn: Arc<dyn Connection>, cluster: Arc<dyn ClusterHandle>) -> Self {
        Self::with_options(conn, cluster, RunOptions::default())
    }

    pub fn with_options(
        conn: Arc<dyn Connection>,
        cluster: Arc<dyn ClusterHandle>,
        options: RunOptions,
    ) -> Self {
        Self {
            conn,
            cluster,
            options,
            observer: None,
        }
    }

    /// Called with each phase as the run enters it.
    pub fn on_phase(mut self, observer: impl Fn(RunPhase) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Run one workload and return its report.
    ///
    /// An invalid config is returned as `Err` before setup runs. Everything
    /// after that, including setup and teardown failures, ends up in the
    /// report. Teardown runs whenever setup was entered.
    pub async fn execute(&self, config: WorkloadConfig) -> Result<RunReport, ConfigError> {
        let table = TransitionTable::build(&config)?;
        Ok(self.execute_validated(Arc::new(config), Arc::new(table)).await)
    }

    /// Run several workloads one after another. All configs are validated
    /// before the first one starts.
    pub async fn execute_serial(
        &self,
        configs: Vec<WorkloadConfig>,
    ) -> Result<Vec<RunReport>, ConfigError> {
        let validated = configs
            .into_iter()
            .map(|config| {
                let table = TransitionTable::build(&config)?;
                Ok((Arc::new(config), Arc::new(table)))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let mut reports = Vec::with_capacity(validated.len());
        for (config, table) in validated {
            reports.push(self.execute_validated(config, table).await);
        }
        Ok(reports)
    }

    async fn execute_validated(
        &self,
        config: Arc<WorkloadConfig>,
        table: Arc<TransitionTable>,
    ) -> RunReport {
        let seed = self.options.seed.unwrap_or_else(rand::random);
        let mut report = RunReport::begin(&config, seed);
        self.notify(RunPhase::Init);
        info!(
            workload = %config.name,
            seed,
            threads = config.thread_count,
            iterations = config.iterations,
            "starting workload"
        );

        if let Some(skip) = &config.skip
            && let Some(reason) = skip(self.cluster.as_ref())
        {
            info!(workload = %config.name, %reason, "skipping workload");
            report.skip_reason = Some(reason);
            self.notify(RunPhase::Skipped);
            return report.finish();
        }

        let mutex = MutexCoordinator::new(self.conn.clone(), self.options.mutex_collection.clone());

        report.enter(RunPhase::Setup);
        self.notify(RunPhase::Setup);
        let (data, setup) = self
            .run_hook(config.setup.clone(), &config, &mutex, config.data.clone())
            .await;

        if let Err(e) = setup {
            error!(workload = %config.name, error = %e, "setup failed");
            report.setup_error = Some(e.to_string());
        } else {
            report.enter(RunPhase::Running);
            self.notify(RunPhase::Running);
            for outcome in self
                .run_workers(config.clone(), table, mutex.clone(), data.clone(), seed)
                .await
            {
                report.record(outcome);
            }
        }

        report.enter(RunPhase::Teardown);
        self.notify(RunPhase::Teardown);
        let (_, teardown) = self
            .run_hook(config.teardown.clone(), &config, &mutex, data)
            .await;
        if let Err(e) = teardown {
            error!(workload = %config.name, error = %e, "teardown failed");
            report.teardown_error = Some(e.to_string());
        }

        let report = report.finish();
        for group in report.grouped_failures() {
            warn!(workload = %config.name, tids = ?group.tids, "{}", group.message);
        }
        info!(
            workload = %config.name,
            status = %report.status,
            iterations = report.total_iterations(),
            expected_errors = report.expected_error_count(),
            duration_ms = report.duration_ms,
            "workload finished"
        );
        if let Some(phase) = report.phases.last() {
            self.notify(*phase);
        }
        report
    }

    fn notify(&self, phase: RunPhase) {
        if let Some(observer) = &self.observer {
            observer(phase);
        }
    }

    // Setup and teardown may block on the store, so they run off the runtime.
    // Returns the data template alongside the result. A hook that fails or
    // panics leaves the template as it was before the call.
    async fn run_hook(
        &self,
        hook: Option<Arc<dyn PhaseHook>>,
        config: &WorkloadConfig,
        mutex: &MutexCoordinator,
        data: Value,
    ) -> (Value, Result<(), HandlerError>) {
        let Some(hook) = hook else {
            return (data, Ok(()));
        };
        let conn = self.conn.clone();
        let cluster = self.cluster.clone();
        let mutex = mutex.clone();
        let resource = config.resource.clone();
        let fallback = data.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let mut data = data;
            let env = PhaseEnv {
                conn: conn.as_ref(),
                resource: &resource,
                cluster: cluster.as_ref(),
                mutex: &mutex,
            };
            let result = hook.run(&env, &mut data);
            (data, result)
        })
        .await;

        match joined {
            Ok((data, Ok(()))) => (data, Ok(())),
            Ok((_, Err(e))) => (fallback, Err(e)),
            Err(e) => (fallback, Err(HandlerError::failed(format!("hook panicked: {e}")))),
        }
    }

    // One native thread per worker; the runtime waits on a blocking task.
    async fn run_workers(
        &self,
        config: Arc<WorkloadConfig>,
        table: Arc<TransitionTable>,
        mutex: MutexCoordinator,
        data: Value,
        seed: u64,
    ) -> Vec<WorkerOutcome> {
        let conn = self.conn.clone();
        let trace_states = self.options.trace_states;
        let start_barrier = self.options.start_barrier;
        let thread_count = config.thread_count;

        let joined = tokio::task::spawn_blocking(move || {
            let gate = Arc::new(StartGate::default());
            let mut handles = Vec::with_capacity(thread_count);
            let mut outcomes = Vec::with_capacity(thread_count);

            for tid in 0..thread_count {
                let config = config.clone();
                let table = table.clone();
                let mutex = mutex.clone();
                let conn = conn.clone();
                let gate = gate.clone();
                let ctx = WorkerContext::new(tid, data.clone(), seed);

                let spawned = std::thread::Builder::new()
                    .name(format!("fsm-worker-{tid}"))
                    .spawn(move || {
                        if start_barrier {
                            gate.wait();
                        }
                        WorkerRunner::new(&config, &table, &mutex, conn.as_ref())
                            .trace_states(trace_states)
                            .run(ctx, &mut transition_rng(seed, tid))
                    });
                match spawned {
                    Ok(handle) => handles.push((tid, handle)),
                    Err(e) => {
                        error!(tid, error = %e, "failed to spawn worker thread");
                        outcomes.push(WorkerOutcome::aborted(
                            tid,
                            worker_seed(seed, tid),
                            format!("failed to spawn worker thread: {e}"),
                        ));
                    }
                }
            }
            gate.open();

            // Join every worker; one failure never cancels its siblings.
            for (tid, handle) in handles {
                let outcome = handle.join().unwrap_or_else(|_| {
                    WorkerOutcome::aborted(tid, worker_seed(seed, tid), "worker thread panicked")
                });
                outcomes.push(outcome);
            }
            outcomes
        })
        .await;

        joined.unwrap_or_else(|e| {
            error!(error = %e, "worker pool task failed");
            (0..thread_count)
                .map(|tid| {
                    WorkerOutcome::aborted(tid, worker_seed(seed, tid), format!("worker pool failed: {e}"))
                })
                .collect()
        })
    }
}

/// Start latch: workers block in `wait` until `open` is called once.
#[derive(Default)]
struct StartGate {
    open: Mutex<bool>,
    ready: Condvar,
}

impl StartGate {
    fn open(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.ready.notify_all();
    }

    fn wait(&self) {
        let guard = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let _open = self
            .ready
            .wait_while(guard, |open| !*open)
            .unwrap_or_else(PoisonError::into_inner);
    }
}
