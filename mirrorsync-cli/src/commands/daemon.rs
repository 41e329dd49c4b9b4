//! `mirrorsync daemon` — background scheduler lifecycle.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use mirrorsync_core::config;

use mirrorsync_daemon::paths::socket_path;
use mirrorsync_daemon::{request_reload, request_status, request_stop, start_blocking, DaemonError};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (scheduler + config watcher + socket server).
    Start,
    /// Request graceful shutdown; in-flight syncs finish first.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
    /// Re-read configuration and reschedule changed jobs.
    Reload,
}

pub fn run(command: DaemonCommand, config_path: Option<&Path>) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;

    match command {
        DaemonCommand::Start => {
            let path = config::discover(config_path).context("failed to locate configuration")?;
            start_blocking(&home, &path).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => {
            let payload = match request_status(&home) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload)
                    .context("failed to render daemon status JSON")?
            );
        }
        DaemonCommand::Reload => {
            let report = request_reload(&home).context("failed to reload daemon configuration")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report)
                    .context("failed to render reload report JSON")?
            );
        }
    }

    Ok(())
}
