//! Built-in demo workloads runnable from the command line against the
//! in-memory store.

use rand::Rng;
use serde_json::{Value, json};
use tracing::info;

use crate::error::{DUPLICATE_KEY, HandlerError};
use crate::state_machine::{HandlerResult, PhaseEnv, StateEnv, WorkloadConfig};
use crate::store::{Document, doc};
use crate::worker::WorkerContext;

/// Name and one-line description of every built-in workload.
pub const BUILTIN: &[(&str, &str)] = &[
    ("alternate", "two states visited in strict alternation"),
    ("mutex_counter", "workers increment a shared counter under the document mutex"),
    ("duplicate_insert", "concurrent inserts of overlapping ids; duplicate keys are expected"),
];

pub fn builtin(name: &str) -> Option<WorkloadConfig> {
    match name {
        "alternate" => Some(alternate()),
        "mutex_counter" => Some(mutex_counter()),
        "duplicate_insert" => Some(duplicate_insert()),
        _ => None,
    }
}

fn alternate() -> WorkloadConfig {
    fn touch(_: &StateEnv<'_>, ctx: &mut WorkerContext) -> HandlerResult {
        bump(&mut ctx.data, "steps");
        Ok(())
    }

    WorkloadConfig::new("alternate")
        .state("A", touch)
        .state("B", touch)
        .start_state("A")
        .transition("A", [("B", 1.0)])
        .transition("B", [("A", 1.0)])
        .data(json!({ "steps": 0 }))
        .threads(1)
        .iterations(4)
}

fn mutex_counter() -> WorkloadConfig {
    fn increment(env: &StateEnv<'_>, ctx: &mut WorkerContext) -> HandlerResult {
        let Some(_guard) = env.mutex.try_acquire(env.resource)? else {
            bump(&mut ctx.data, "contended");
            return Ok(());
        };
        let counter = counter_filter();
        let current = env
            .conn
            .find(env.resource, &counter)?
            .first()
            .and_then(|d| d.get("n"))
            .and_then(Value::as_u64)
            .ok_or_else(|| HandlerError::failed("counter document is missing"))?;
        env.conn
            .update(env.resource, &counter, &doc(json!({ "n": current + 1 })), false)?;
        bump(&mut ctx.data, "increments");
        Ok(())
    }

    fn read(env: &StateEnv<'_>, _: &mut WorkerContext) -> HandlerResult {
        env.conn.find(env.resource, &counter_filter())?;
        Ok(())
    }

    fn setup(env: &PhaseEnv<'_>, _: &mut Value) -> HandlerResult {
        env.mutex.provision(env.resource)?;
        env.conn
            .insert(env.resource, doc(json!({ "_id": "counter", "n": 0 })))?;
        Ok(())
    }

    fn teardown(env: &PhaseEnv<'_>, _: &mut Value) -> HandlerResult {
        let n = env
            .conn
            .find(env.resource, &counter_filter())?
            .first()
            .and_then(|d| d.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        info!(resource = env.resource, n, "final counter value");
        env.mutex.remove(env.resource)?;
        env.conn.run_command(&doc(json!({ "drop": env.resource })))?;
        Ok(())
    }

    WorkloadConfig::new("mutex_counter")
        .state("init", read)
        .state("increment", increment)
        .state("read", read)
        .transition("init", [("increment", 1.0)])
        .transition("increment", [("increment", 3.0), ("read", 1.0)])
        .transition("read", [("increment", 1.0)])
        .data(json!({ "increments": 0, "contended": 0 }))
        .setup(setup)
        .teardown(teardown)
        .threads(8)
        .iterations(200)
}

fn duplicate_insert() -> WorkloadConfig {
    fn insert(env: &StateEnv<'_>, ctx: &mut WorkerContext) -> HandlerResult {
        let span = ctx.data["idSpace"].as_u64().unwrap_or(16);
        let id = ctx.rng().random_range(0..span);
        env.conn
            .insert(env.resource, doc(json!({ "_id": id, "tid": ctx.tid() })))?;
        bump(&mut ctx.data, "inserted");
        Ok(())
    }

    fn scan(env: &StateEnv<'_>, _: &mut WorkerContext) -> HandlerResult {
        env.conn.find(env.resource, &Document::new())?;
        Ok(())
    }

    fn teardown(env: &PhaseEnv<'_>, _: &mut Value) -> HandlerResult {
        env.conn.run_command(&doc(json!({ "drop": env.resource })))?;
        Ok(())
    }

    WorkloadConfig::new("duplicate_insert")
        .state("init", scan)
        .state("insert", insert)
        .state("scan", scan)
        .transition("init", [("insert", 1.0)])
        .transition("insert", [("insert", 4.0), ("scan", 1.0)])
        .transition("scan", [("insert", 1.0)])
        .data(json!({ "idSpace": 16, "inserted": 0, "expectedErrorCodes": [DUPLICATE_KEY] }))
        .teardown(teardown)
        .threads(4)
        .iterations(50)
}

fn counter_filter() -> Document {
    doc(json!({ "_id": "counter" }))
}

fn bump(data: &mut Value, key: &str) {
    let n = data[key].as_u64().unwrap_or(0);
    data[key] = json!(n + 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{Orchestrator, RunOptions};
    use crate::report::RunStatus;
    use crate::state_machine::TransitionTable;
    use crate::store::{Connection, MemoryStore, SingleNode};
    use std::sync::Arc;

    fn orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
        let conn: Arc<dyn Connection> = store;
        Orchestrator::with_options(
            conn.clone(),
            Arc::new(SingleNode::new(conn)),
            RunOptions {
                seed: Some(3),
                ..Default::default()
            },
        )
    }

    #[test]
    fn every_builtin_is_valid() {
        for (name, _) in BUILTIN {
            let config = builtin(name).unwrap();
            assert_eq!(config.name, *name);
            TransitionTable::build(&config).unwrap();
        }
        assert!(builtin("nope").is_none());
    }

    #[tokio::test]
    async fn mutex_counter_matches_increments_and_cleans_up() {
        let store = Arc::new(MemoryStore::new());
        let report = orchestrator(store.clone())
            .execute(builtin("mutex_counter").unwrap().threads(4).iterations(40))
            .await
            .unwrap();

        assert!(report.is_clean());
        assert!(store.find("mutex_counter", &Document::new()).unwrap().is_empty());
        assert!(store.find("fsm_mutexes", &Document::new()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_insert_only_sees_expected_errors() {
        let report = orchestrator(Arc::new(MemoryStore::new()))
            .execute(builtin("duplicate_insert").unwrap())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Done);
        assert!(report.expected_error_count() > 0);
        let inserted: u64 = report
            .workers
            .iter()
            .map(|w| w.final_data["inserted"].as_u64().unwrap())
            .sum();
        assert!(inserted <= 16);
    }

    #[test]
    fn bump_counts_from_missing_key() {
        let mut data = json!({});
        bump(&mut data, "x");
        bump(&mut data, "x");
        assert_eq!(data["x"], json!(2));
    }
}
