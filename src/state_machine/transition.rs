use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::ConfigError;

use super::workload::WorkloadConfig;

/// Positive-weight edges out of one state, in declaration order.
#[derive(Debug, Clone, Default)]
struct Edges {
    targets: Vec<String>,
    // Running weight sums normalized by the total, so the last entry is 1.0.
    cumulative: Vec<f64>,
}

/// Validated, immutable weighted transition graph.
///
/// Built once per run and shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    start_state: String,
    edges: HashMap<String, Edges>,
}

impl TransitionTable {
    /// Validate a workload and precompute the sampling tables.
    ///
    /// Checks that thread count and iterations are positive, that the start
    /// state, terminal states, transition sources and targets all name
    /// declared states, that weights are finite and non-negative, and that
    /// every state reachable from the start state either has positive
    /// outgoing weight or is declared terminal.
    pub fn build(config: &WorkloadConfig) -> Result<Self, ConfigError> {
        if config.thread_count == 0 {
            return Err(ConfigError::ZeroThreadCount);
        }
        if config.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if !config.states.contains_key(&config.start_state) {
            return Err(ConfigError::UnknownStartState(config.start_state.clone()));
        }
        if let Some(unknown) = config
            .terminal_states
            .iter()
            .find(|s| !config.states.contains_key(*s))
        {
            return Err(ConfigError::UnknownTerminal(unknown.clone()));
        }

        let mut edges: HashMap<String, Edges> = HashMap::new();
        for (from, targets) in &config.transitions {
            if !config.states.contains_key(from) {
                return Err(ConfigError::UnknownSource(from.clone()));
            }
            if edges.contains_key(from) {
                return Err(ConfigError::DuplicateSource(from.clone()));
            }

            let mut total = 0.0;
            for (to, weight) in targets {
                if !config.states.contains_key(to) {
                    return Err(ConfigError::UnknownTarget {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(ConfigError::InvalidWeight {
                        from: from.clone(),
                        to: to.clone(),
                        weight: *weight,
                    });
                }
                total += weight;
            }

            let mut entry = Edges::default();
            let mut running = 0.0;
            for (to, weight) in targets.iter().filter(|(_, w)| *w > 0.0) {
                running += weight;
                entry.targets.push(to.clone());
                entry.cumulative.push(running / total);
            }
            edges.insert(from.clone(), entry);
        }

        let table = Self {
            start_state: config.start_state.clone(),
            edges,
        };
        table.check_reachable(config)?;
        Ok(table)
    }

    // Breadth-first walk over positive edges from the start state.
    fn check_reachable(&self, config: &WorkloadConfig) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.start_state.as_str()]);
        while let Some(state) = queue.pop_front() {
            if !seen.insert(state) {
                continue;
            }
            if self.is_terminal(state) {
                if !config.terminal_states.contains(state) {
                    return Err(ConfigError::DeadEnd(state.to_string()));
                }
                continue;
            }
            queue.extend(self.targets(state));
        }
        Ok(())
    }

    pub fn start_state(&self) -> &str {
        &self.start_state
    }

    /// True if `state` has no outgoing edge with positive weight.
    pub fn is_terminal(&self, state: &str) -> bool {
        self.edges.get(state).is_none_or(|e| e.targets.is_empty())
    }

    /// Targets of `state` that can be sampled, in declaration order.
    pub fn targets(&self, state: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(state)
            .into_iter()
            .flat_map(|e| e.targets.iter().map(String::as_str))
    }

    /// Map `r` in `[0, 1)` to the next state by linear scan of the cumulative
    /// weights. Ties go to the target declared first. Out-of-range values are
    /// clamped into the interval.
    pub fn next(&self, current: &str, r: f64) -> Result<&str, ConfigError> {
        let edges = self
            .edges
            .get(current)
            .filter(|e| !e.targets.is_empty())
            .ok_or_else(|| ConfigError::NoTransitions(current.to_string()))?;

        let r = if r.is_finite() { r.clamp(0.0, 1.0) } else { 0.0 };
        let chosen = edges
            .cumulative
            .iter()
            .position(|c| r < *c)
            // Rounding can leave the last cumulative entry a hair under 1.0.
            .unwrap_or(edges.targets.len() - 1);
        Ok(&edges.targets[chosen])
    }
}
