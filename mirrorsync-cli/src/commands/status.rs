//! `mirrorsync status` — per-job scheduler state from the running daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use mirrorsync_daemon::paths::socket_path;
use mirrorsync_daemon::{request_status, DaemonError};
use mirrorsync_engine::{JobState, JobStatus};

/// Arguments for `mirrorsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "job")]
    job: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "interval")]
    interval: String,
    #[tabled(rename = "next run")]
    next_run: String,
    #[tabled(rename = "last run")]
    last_run: String,
    #[tabled(rename = "last result")]
    last_result: String,
    #[tabled(rename = "skipped ticks")]
    skipped_ticks: u64,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;

        let payload = match request_status(&home) {
            Ok(payload) => payload,
            Err(DaemonError::DaemonNotRunning { socket }) => {
                if self.json {
                    print_json(&json!({
                        "running": false,
                        "socket": socket.display().to_string(),
                    }))?;
                } else {
                    println!(
                        "daemon is not running (no socket at {}); start it with `mirrorsync daemon start`",
                        socket_path(&home).display()
                    );
                }
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            return print_json(&payload);
        }

        let jobs: Vec<JobStatus> = serde_json::from_value(payload["jobs"].clone())
            .context("daemon returned malformed job status")?;
        print_table(&payload, jobs);
        Ok(())
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_table(payload: &Value, jobs: Vec<JobStatus>) {
    let scheduled = jobs
        .iter()
        .filter(|j| j.state != JobState::Disabled)
        .count();
    println!(
        "mirrorsync v{} | daemon since {} | {} jobs | {} scheduled",
        env!("CARGO_PKG_VERSION"),
        payload["started_at"].as_str().unwrap_or("?"),
        jobs.len(),
        scheduled,
    );

    if jobs.is_empty() {
        println!("No jobs configured.");
        return;
    }

    let rows: Vec<StatusTableRow> = jobs
        .into_iter()
        .map(|job| StatusTableRow {
            job: job.job.to_string(),
            state: state_label(job.state, job.enabled),
            interval: job
                .interval_secs
                .map(|secs| format!("{secs}s"))
                .unwrap_or_else(|| "-".to_string()),
            next_run: format_when(job.next_run_at),
            last_run: format_when(job.last_run_at),
            last_result: match job.last_success {
                Some(true) => "ok".green().to_string(),
                Some(false) => "failed".red().to_string(),
                None => "-".to_string(),
            },
            skipped_ticks: job.skipped_ticks,
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn state_label(state: JobState, enabled: bool) -> String {
    match state {
        JobState::Running => "RUNNING".cyan().bold().to_string(),
        JobState::Scheduled => "SCHEDULED".green().to_string(),
        JobState::Disabled if !enabled => "DISABLED".bright_black().to_string(),
        JobState::Disabled => "MANUAL".normal().to_string(),
    }
}

pub(crate) fn format_when(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}
