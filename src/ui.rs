//! Terminal output for `fsmrun run`: a phase spinner and a colored summary.
//!
//! Uses `indicatif` for the spinner and `console` for styling. The
//! [`RunProgress`] follows a run through its phases.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::report::{RunPhase, RunReport, RunStatus};

pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl RunProgress {
    /// Starts the spinner for `workload`.
    pub fn start(workload: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("{}: {workload}", RunPhase::Init));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// A handle usable from the orchestrator's phase observer.
    pub fn bar(&self) -> ProgressBar {
        self.pb.clone()
    }

    pub fn phase(bar: &ProgressBar, workload: &str, phase: RunPhase) {
        bar.set_message(format!("{phase}: {workload}"));
    }

    /// Stops the spinner and prints the outcome line.
    pub fn complete(&self, report: &RunReport) {
        self.pb.finish_and_clear();
        match report.status {
            RunStatus::Done => println!(
                "  {} {} completed in {}ms",
                self.green.apply_to("✓"),
                report.workload,
                report.duration_ms
            ),
            RunStatus::Failed => println!(
                "  {} {} failed",
                self.red.apply_to("✗"),
                report.workload
            ),
            RunStatus::Skipped => println!(
                "  {} {} skipped: {}",
                self.yellow.apply_to("-"),
                report.workload,
                report.skip_reason.as_deref().unwrap_or_default()
            ),
        }
    }

    /// Prints per-run totals, per-state visits and every failure.
    pub fn print_summary(&self, report: &RunReport) {
        println!(
            "    {} seed={} threads={} iterations={}",
            self.dim.apply_to("run"),
            report.seed,
            report.thread_count,
            report.iterations
        );
        println!(
            "    {} {} steps, {} expected errors",
            self.dim.apply_to("total"),
            report.total_iterations(),
            report.expected_error_count()
        );
        for (state, visits) in report.state_visits() {
            println!("    {} {state}: {visits}", self.dim.apply_to("state"));
        }
        if let Some(e) = &report.setup_error {
            println!("    {} {e}", self.red.apply_to("setup"));
        }
        for group in report.grouped_failures() {
            println!(
                "    {} {} (tids {:?})",
                self.red.apply_to("worker"),
                group.message,
                group.tids
            );
        }
        if let Some(e) = &report.teardown_error {
            println!("    {} {e}", self.yellow.apply_to("teardown"));
        }
    }

    /// Prints the full report as pretty JSON.
    pub fn print_json(report: &RunReport) -> serde_json::Result<()> {
        println!("{}", serde_json::to_string_pretty(report)?);
        Ok(())
    }
}
