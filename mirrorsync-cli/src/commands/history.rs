//! `mirrorsync history` — recorded sync runs and aggregate statistics.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use mirrorsync_core::{config, JobName};
use mirrorsync_engine::history::{self, HistoryRecord, HistoryStats};

use super::status::format_when;

/// Arguments for `mirrorsync history`.
#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Only show runs of this job.
    #[arg(long)]
    pub job: Option<String>,

    /// Maximum number of runs to show, newest first.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    /// Skip this many matching runs before listing.
    #[arg(long, default_value_t = 0)]
    pub offset: usize,

    /// Show aggregate statistics instead of individual runs.
    #[arg(long)]
    pub stats: bool,

    /// Show one recorded run in full.
    #[arg(long, value_name = "ID", conflicts_with_all = ["stats", "clear", "delete"])]
    pub show: Option<String>,

    /// Delete one recorded run.
    #[arg(long, value_name = "ID", conflicts_with_all = ["stats", "clear"])]
    pub delete: Option<String>,

    /// Delete recorded runs (only those of `--job` when given).
    #[arg(long, conflicts_with = "stats")]
    pub clear: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct HistoryTableRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "when")]
    when: String,
    #[tabled(rename = "job")]
    job: String,
    #[tabled(rename = "result")]
    result: String,
    #[tabled(rename = "pushed")]
    pushed: usize,
    #[tabled(rename = "skipped")]
    skipped: usize,
    #[tabled(rename = "failed")]
    failed: usize,
    #[tabled(rename = "duration")]
    duration: String,
}

impl HistoryArgs {
    pub fn run(self) -> Result<()> {
        let state = config::state_dir().context("could not determine state directory")?;
        let job = self.job.map(JobName::from);

        if let Some(id) = self.show.as_deref() {
            let record = history::record_at(&state, id)
                .context("failed to read sync history")?
                .with_context(|| format!("no recorded run with id '{id}'"))?;
            if self.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&record)
                        .context("failed to serialize history JSON")?
                );
            } else {
                print_record(&record);
            }
            return Ok(());
        }

        if let Some(id) = self.delete.as_deref() {
            if !history::delete_at(&state, id).context("failed to delete recorded run")? {
                bail!("no recorded run with id '{id}'");
            }
            println!("removed run {id}");
            return Ok(());
        }

        if self.clear {
            let removed =
                history::clear_at(&state, job.as_ref()).context("failed to clear sync history")?;
            println!("removed {removed} recorded runs");
            return Ok(());
        }

        if self.stats {
            let stats = history::stats_at(&state).context("failed to read sync history")?;
            if self.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&stats)
                        .context("failed to serialize history JSON")?
                );
            } else {
                print_stats(&stats);
            }
            return Ok(());
        }

        let records = history::records_at(&state, job.as_ref(), self.limit, self.offset)
            .context("failed to read sync history")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&records)
                    .context("failed to serialize history JSON")?
            );
            return Ok(());
        }
        print_records(records);
        Ok(())
    }
}

fn print_records(records: Vec<HistoryRecord>) {
    if records.is_empty() {
        println!("No sync runs recorded.");
        return;
    }

    let rows: Vec<HistoryTableRow> = records
        .into_iter()
        .map(|record| HistoryTableRow {
            id: record.id.clone(),
            when: format_when(Some(record.timestamp)),
            job: record.job.to_string(),
            result: match (record.success, record.dry_run) {
                (true, true) => "ok (dry-run)".green().to_string(),
                (true, false) => "ok".green().to_string(),
                (false, _) => "failed".red().to_string(),
            },
            pushed: record.pushed.len(),
            skipped: record.skipped.len(),
            failed: record.failed.len(),
            duration: format!("{} ms", record.duration_ms),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn print_record(record: &HistoryRecord) {
    let result = if record.success {
        "ok".green().to_string()
    } else {
        "failed".red().to_string()
    };
    println!(
        "{} '{}' at {}: {}{} ({} ms)",
        record.id,
        record.job,
        format_when(Some(record.timestamp)),
        result,
        if record.dry_run { " [dry-run]" } else { "" },
        record.duration_ms,
    );
    for (label, refs) in [
        ("pushed", &record.pushed),
        ("skipped", &record.skipped),
        ("failed", &record.failed),
    ] {
        if !refs.is_empty() {
            println!("  {label:<8} {}", refs.join(", "));
        }
    }
    if let Some(error) = &record.error {
        println!("  error    {error}");
    }
}

fn print_stats(stats: &HistoryStats) {
    println!(
        "{} runs | {} successful | {} failed | {:.1}% success",
        stats.total, stats.successful, stats.failed, stats.success_rate
    );
    for (job, job_stats) in &stats.jobs {
        println!(
            "  {:<24} {} runs, {} failed, last {}",
            job.to_string(),
            job_stats.total,
            job_stats.failed,
            format_when(job_stats.last_run_at),
        );
    }
}
