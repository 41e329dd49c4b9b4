//! `mirrorsync sync` — run jobs in this process and print per-ref decisions.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use mirrorsync_core::{config, JobName, RefDecision, RefOutcome, SyncResult};
use mirrorsync_engine::history::{self, HistoryRecord};
use mirrorsync_engine::{RunOutcome, Scheduler};

/// Arguments for `mirrorsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Job to sync; every enabled job when omitted.
    pub job: Option<String>,

    /// Decide every ref but push nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self, config_path: Option<&Path>) -> Result<ExitCode> {
        let (_, settings) = crate::load_settings(config_path)?;
        let scheduler =
            Scheduler::from_settings(&settings).context("failed to build job registry")?;
        let job = self.job.map(JobName::from);

        let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
        let outcome = runtime
            .block_on(scheduler.run_once(job.as_ref(), self.dry_run))
            .context("sync failed")?;

        record_history(&outcome);

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome).context("failed to serialize sync JSON")?
            );
        } else {
            print_outcome(&outcome);
        }

        Ok(if outcome.success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
}

/// History is best effort here; a sync that worked is not failed over it.
fn record_history(outcome: &RunOutcome) {
    let state = match config::state_dir() {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!(error = %err, "skipping sync history");
            return;
        }
    };
    for result in outcome.results() {
        if let Err(err) = history::append_at(&state, HistoryRecord::from_result(result)) {
            tracing::warn!(job = %result.job, error = %err, "failed to record sync history");
        }
    }
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Single(result) => print_result(result),
        RunOutcome::Batch(summary) => {
            if summary.results.is_empty() {
                println!("No enabled jobs configured.");
                return;
            }
            for result in &summary.results {
                print_result(result);
            }
            println!(
                "{} jobs: {} succeeded, {} failed ({} ms)",
                summary.total, summary.successful, summary.failed, summary.duration_ms
            );
        }
    }
}

fn print_result(result: &SyncResult) {
    let prefix = if result.dry_run { "[dry-run] " } else { "" };
    let mark = if result.success {
        "✓".green().bold()
    } else {
        "✗".red().bold()
    };
    println!(
        "{prefix}{mark} '{}': {} pushed, {} up-to-date, {} diverged, {} filtered, {} failed ({} ms)",
        result.job,
        result.count(RefOutcome::Pushed),
        result.count(RefOutcome::SkippedUpToDate),
        result.count(RefOutcome::SkippedDiverged),
        result.count(RefOutcome::SkippedFiltered),
        result.count(RefOutcome::Failed),
        result.duration_ms,
    );
    if let Some(error) = &result.error {
        println!("  {} {error}", "error:".red());
    }
    for decision in &result.decisions {
        println!("  {}", decision_line(decision, result.dry_run));
    }
}

fn decision_line(decision: &RefDecision, dry_run: bool) -> String {
    let symbol = match decision.outcome {
        RefOutcome::Pushed => "↑".green().to_string(),
        RefOutcome::SkippedUpToDate => "=".bright_black().to_string(),
        RefOutcome::SkippedDiverged => "!".yellow().to_string(),
        RefOutcome::SkippedFiltered => "·".bright_black().to_string(),
        RefOutcome::Failed => "✗".red().to_string(),
    };
    let verb = if dry_run && decision.outcome == RefOutcome::Pushed {
        "would push"
    } else {
        ""
    };
    let commits = match (&decision.target_commit, &decision.source_commit) {
        (Some(from), Some(to)) if from != to => format!(" {} → {}", from.short(), to.short()),
        (None, Some(to)) => format!(" {}", to.short()),
        _ => String::new(),
    };
    format!(
        "{symbol} {} {:<24} {}{}{commits}",
        decision.kind,
        decision.name,
        if verb.is_empty() { String::new() } else { format!("{verb}: ") },
        decision.reason,
    )
}
