//! mirrorsync — mirror git branches and tags between remotes, never force-pushing.
//!
//! # Usage
//!
//! ```text
//! mirrorsync sync [JOB] [--dry-run] [--json]
//! mirrorsync status [--json]
//! mirrorsync history [--job <name>] [--limit <n>] [--stats] [--json]
//! mirrorsync daemon start|stop|status|reload
//! ```
//!
//! `--config <path>` selects a configuration directory or file; otherwise
//! `$MIRRORSYNC_CONFIG`, then a `configs/` directory near the working directory.

mod commands;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, history::HistoryArgs, status::StatusArgs, sync::SyncArgs,
};
use mirrorsync_core::{config, Settings};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "mirrorsync",
    version,
    about = "Mirror git branches and tags between remotes without force-pushing",
    long_about = None,
)]
struct Cli {
    /// Configuration directory or YAML file.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync one job, or every enabled job, in this process.
    Sync(SyncArgs),

    /// Show per-job scheduler state from the running daemon.
    Status(StatusArgs),

    /// Show recorded sync runs.
    History(HistoryArgs),

    /// Manage the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

/// Locate and load configuration, honouring `--config`.
pub(crate) fn load_settings(explicit: Option<&Path>) -> Result<(PathBuf, Settings)> {
    let path = config::discover(explicit).context("failed to locate configuration")?;
    let settings = config::load_at(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    Ok((path, settings))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Sync(args) => args.run(config),
        Commands::Status(args) => args.run().map(|()| ExitCode::SUCCESS),
        Commands::History(args) => args.run().map(|()| ExitCode::SUCCESS),
        Commands::Daemon { command } => {
            commands::daemon::run(command, config).map(|()| ExitCode::SUCCESS)
        }
    }
}
