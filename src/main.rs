mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

use fsmrun::ui::RunProgress;
use fsmrun::{
    Connection, EngineConfig, MemoryStore, Orchestrator, RunOptions, RunStatus, SingleNode,
    TransitionTable, workloads,
};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = EngineConfig::load()?;

    let default_level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::List => {
            for (name, description) in workloads::BUILTIN {
                println!("{name:<18} {description}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { workload } => {
            let config = builtin(&workload)?;
            TransitionTable::build(&config)
                .with_context(|| format!("workload '{workload}' is invalid"))?;
            println!("{workload}: ok");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            workload,
            threads,
            iterations,
            trace,
            json,
        } => {
            let mut workload_config = builtin(&workload)?;
            if let Some(n) = threads {
                workload_config.thread_count = n;
            }
            if let Some(n) = iterations {
                workload_config.iterations = n;
            }

            let mut options = RunOptions::from(&config);
            options.seed = cli.seed.or(options.seed);
            options.trace_states |= trace;

            let store: Arc<dyn Connection> = Arc::new(MemoryStore::new());
            let cluster = Arc::new(SingleNode::new(store.clone()));

            let progress = (!json).then(|| RunProgress::start(&workload));
            let mut orchestrator = Orchestrator::with_options(store, cluster, options);
            if let Some(progress) = &progress {
                let bar = progress.bar();
                let name = workload.clone();
                orchestrator = orchestrator
                    .on_phase(move |phase| RunProgress::phase(&bar, &name, phase));
            }

            let report = orchestrator
                .execute(workload_config)
                .await
                .with_context(|| format!("workload '{workload}' is invalid"))?;

            match &progress {
                Some(progress) => {
                    progress.complete(&report);
                    progress.print_summary(&report);
                }
                None => RunProgress::print_json(&report)?,
            }

            Ok(match report.status {
                RunStatus::Done if report.is_clean() => ExitCode::SUCCESS,
                RunStatus::Skipped => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            })
        }
    }
}

fn builtin(name: &str) -> Result<fsmrun::WorkloadConfig> {
    match workloads::builtin(name) {
        Some(config) => Ok(config),
        None => bail!("unknown workload '{name}'. Run `fsmrun list` to see the built-in workloads."),
    }
}
