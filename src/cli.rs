//! Command line interface for fsmrun, built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (run, list, validate) and
//! the global flags (--seed, --verbose).

use clap::{Parser, Subcommand};

/// fsmrun: state-machine driven concurrent workload executor.
#[derive(Debug, Parser)]
#[command(name = "fsmrun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Seed for every random choice in the run. Overrides fsmrun.toml and FSMRUN_SEED.
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Log state transitions and expected errors.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs a built-in workload against the in-memory store.
    Run {
        /// Name of the workload (see `fsmrun list`).
        workload: String,

        /// Number of concurrent workers.
        #[arg(long, short = 't')]
        threads: Option<usize>,

        /// Steps each worker takes.
        #[arg(long, short = 'n')]
        iterations: Option<u64>,

        /// Record every visited state in the report.
        #[arg(long)]
        trace: bool,

        /// Print the full report as JSON instead of the summary.
        #[arg(long)]
        json: bool,
    },

    /// Lists the built-in workloads.
    List,

    /// Checks a workload's state machine without running it.
    Validate {
        workload: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["fsmrun", "run", "mutex_counter", "-t", "4", "--json"]);
        match cli.command {
            Command::Run {
                workload,
                threads,
                iterations,
                trace,
                json,
            } => {
                assert_eq!(workload, "mutex_counter");
                assert_eq!(threads, Some(4));
                assert!(iterations.is_none());
                assert!(!trace);
                assert!(json);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["fsmrun", "--seed", "99", "--verbose", "list"]);
        assert!(cli.verbose);
        assert_eq!(cli.seed, Some(99));
        assert!(matches!(cli.command, Command::List));
    }

    #[test]
    fn cli_parses_validate_subcommand() {
        let cli = Cli::parse_from(["fsmrun", "validate", "alternate"]);
        match cli.command {
            Command::Validate { workload } => assert_eq!(workload, "alternate"),
            _ => panic!("expected Validate command"),
        }
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
