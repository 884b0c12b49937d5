use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::HandlerError;
use crate::mutex::MutexCoordinator;
use crate::store::{ClusterHandle, Connection};
use crate::worker::WorkerContext;

pub type HandlerResult = Result<(), HandlerError>;

/// What a state handler can reach besides its own context.
pub struct StateEnv<'a> {
    pub conn: &'a dyn Connection,
    /// Resource (collection) the workload operates on.
    pub resource: &'a str,
    pub mutex: &'a MutexCoordinator,
}

/// What a setup or teardown hook can reach.
pub struct PhaseEnv<'a> {
    pub conn: &'a dyn Connection,
    pub resource: &'a str,
    pub cluster: &'a dyn ClusterHandle,
    pub mutex: &'a MutexCoordinator,
}

/// Executable behavior of one named state.
pub trait StateHandler: Send + Sync {
    fn execute(&self, env: &StateEnv<'_>, ctx: &mut WorkerContext) -> HandlerResult;
}

impl<F> StateHandler for F
where
    F: Fn(&StateEnv<'_>, &mut WorkerContext) -> HandlerResult + Send + Sync,
{
    fn execute(&self, env: &StateEnv<'_>, ctx: &mut WorkerContext) -> HandlerResult {
        self(env, ctx)
    }
}

/// A setup or teardown hook. It receives the workload's data template;
/// changes made during setup are what the workers copy.
pub trait PhaseHook: Send + Sync {
    fn run(&self, env: &PhaseEnv<'_>, data: &mut Value) -> HandlerResult;
}

impl<F> PhaseHook for F
where
    F: Fn(&PhaseEnv<'_>, &mut Value) -> HandlerResult + Send + Sync,
{
    fn run(&self, env: &PhaseEnv<'_>, data: &mut Value) -> HandlerResult {
        self(env, data)
    }
}

/// Returns a reason when the workload should not run on the given cluster.
pub type SkipFn = dyn Fn(&dyn ClusterHandle) -> Option<String> + Send + Sync;

/// Declarative description of a workload.
///
/// Handlers are shared behind `Arc`, everything else is plain data, so
/// `clone` yields an independent config whose `data` can be changed without
/// touching the original.
#[derive(Clone)]
pub struct WorkloadConfig {
    pub name: String,
    pub resource: String,
    pub states: BTreeMap<String, Arc<dyn StateHandler>>,
    /// Adjacency list: source state to `(target, weight)` in declaration order.
    pub transitions: Vec<(String, Vec<(String, f64)>)>,
    pub start_state: String,
    pub terminal_states: BTreeSet<String>,
    pub data: Value,
    pub setup: Option<Arc<dyn PhaseHook>>,
    pub teardown: Option<Arc<dyn PhaseHook>>,
    pub skip: Option<Arc<SkipFn>>,
    pub thread_count: usize,
    pub iterations: u64,
}

impl WorkloadConfig {
    /// An empty workload named `name`, operating on a resource of the same
    /// name, starting in `init`, with one thread and one iteration.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            resource: name.clone(),
            name,
            states: BTreeMap::new(),
            transitions: Vec::new(),
            start_state: "init".to_string(),
            terminal_states: BTreeSet::new(),
            data: Value::Object(Default::default()),
            setup: None,
            teardown: None,
            skip: None,
            thread_count: 1,
            iterations: 1,
        }
    }

    pub fn state<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&StateEnv<'_>, &mut WorkerContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.states.insert(name.into(), Arc::new(handler));
        self
    }

    /// Declare the outgoing edges of `from`, replacing any earlier declaration.
    pub fn transition<'a>(
        mut self,
        from: impl Into<String>,
        targets: impl IntoIterator<Item = (&'a str, f64)>,
    ) -> Self {
        let from = from.into();
        let targets: Vec<(String, f64)> = targets
            .into_iter()
            .map(|(to, w)| (to.to_string(), w))
            .collect();
        match self.transitions.iter_mut().find(|(src, _)| *src == from) {
            Some(entry) => entry.1 = targets,
            None => self.transitions.push((from, targets)),
        }
        self
    }

    pub fn start_state(mut self, state: impl Into<String>) -> Self {
        self.start_state = state.into();
        self
    }

    pub fn terminal(mut self, state: impl Into<String>) -> Self {
        self.terminal_states.insert(state.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn setup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PhaseEnv<'_>, &mut Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(hook));
        self
    }

    pub fn teardown<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PhaseEnv<'_>, &mut Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.teardown = Some(Arc::new(hook));
        self
    }

    pub fn skip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&dyn ClusterHandle) -> Option<String> + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    pub fn threads(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    /// The handler registered for `state`, for overrides that delegate to it.
    pub fn handler(&self, state: &str) -> Option<Arc<dyn StateHandler>> {
        self.states.get(state).cloned()
    }

    /// Derive a new workload: `mutator` receives a deep copy to change and
    /// the untouched base to delegate to.
    pub fn extend(&self, mutator: impl FnOnce(&mut WorkloadConfig, &WorkloadConfig)) -> Self {
        let mut derived = self.clone();
        mutator(&mut derived, self);
        derived
    }
}

impl fmt::Debug for WorkloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadConfig")
            .field("name", &self.name)
            .field("resource", &self.resource)
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .field("transitions", &self.transitions)
            .field("start_state", &self.start_state)
            .field("terminal_states", &self.terminal_states)
            .field("data", &self.data)
            .field("setup", &self.setup.is_some())
            .field("teardown", &self.teardown.is_some())
            .field("thread_count", &self.thread_count)
            .field("iterations", &self.iterations)
            .finish()
    }
}

/// Field-by-field overrides applied by [`compose`].
#[derive(Default, Clone)]
pub struct WorkloadOverrides {
    pub name: Option<String>,
    pub resource: Option<String>,
    pub states: BTreeMap<String, Arc<dyn StateHandler>>,
    pub transitions: Option<Vec<(String, Vec<(String, f64)>)>>,
    pub start_state: Option<String>,
    /// Deep-merged into the base data: objects merge key by key, anything
    /// else replaces the base value.
    pub data: Option<Value>,
    pub setup: Option<Arc<dyn PhaseHook>>,
    pub teardown: Option<Arc<dyn PhaseHook>>,
    pub thread_count: Option<usize>,
    pub iterations: Option<u64>,
}

/// Pure composition of a base workload with overrides. The base is only read.
pub fn compose(base: &WorkloadConfig, overrides: WorkloadOverrides) -> WorkloadConfig {
    base.extend(|derived, _| {
        if let Some(name) = overrides.name {
            derived.name = name;
        }
        if let Some(resource) = overrides.resource {
            derived.resource = resource;
        }
        derived.states.extend(overrides.states);
        if let Some(transitions) = overrides.transitions {
            derived.transitions = transitions;
        }
        if let Some(start) = overrides.start_state {
            derived.start_state = start;
        }
        if let Some(data) = overrides.data {
            merge_data(&mut derived.data, data);
        }
        if overrides.setup.is_some() {
            derived.setup = overrides.setup;
        }
        if overrides.teardown.is_some() {
            derived.teardown = overrides.teardown;
        }
        if let Some(n) = overrides.thread_count {
            derived.thread_count = n;
        }
        if let Some(n) = overrides.iterations {
            derived.iterations = n;
        }
    })
}

fn merge_data(base: &mut Value, over: Value) {
    match (base, over) {
        (Value::Object(base), Value::Object(over)) => {
            for (key, value) in over {
                match base.get_mut(&key) {
                    Some(existing) => merge_data(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, over) => *base = over,
    }
}

/// Reads `expectedErrorCodes` from workload data. Missing or malformed
/// entries are ignored.
pub fn expected_error_codes(data: &Value) -> Vec<i32> {
    data.get("expectedErrorCodes")
        .and_then(Value::as_array)
        .map(|codes| {
            codes
                .iter()
                .filter_map(Value::as_i64)
                .filter_map(|c| i32::try_from(c).ok())
                .collect()
        })
        .unwrap_or_default()
}
