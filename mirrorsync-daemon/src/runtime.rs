use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use mirrorsync_core::{config, SyncResult};
use mirrorsync_engine::history::{self, HistoryRecord};
use mirrorsync_engine::{ReloadReport, Scheduler};

use crate::error::{io_err, DaemonError};
use crate::paths::{history_dir, socket_path, state_root, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// State every socket client sees.
struct Shared {
    home: PathBuf,
    config: PathBuf,
    scheduler: Scheduler,
    started_at: DateTime<Utc>,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, config: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config.to_path_buf()))
}

/// Run the daemon until `stop` or ctrl-c, then wait for in-flight syncs.
pub async fn run(home: PathBuf, config_path: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let settings = config::load_at(&config_path)?;
    let scheduler = Scheduler::from_settings(&settings)?;
    // Subscribe before the first trigger can fire.
    let events = scheduler.orchestrator().subscribe();
    scheduler.start();

    let shared = Arc::new(Shared {
        home: home.clone(),
        config: config_path.clone(),
        scheduler: scheduler.clone(),
        started_at: Utc::now(),
    });
    tracing::info!(
        config = %config_path.display(),
        jobs = settings.repositories.len(),
        "daemon started"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (drain_tx, drain_rx) = oneshot::channel::<()>();

    let recorder_handle = {
        let state = state_root(&home);
        tokio::spawn(async move { recorder_task(state, events, drain_rx).await })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let config_path = config_path.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let result = watcher_task(config_path, scheduler, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let result = socket_server_task(shared, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (watcher_result, socket_result, signal_result) =
        tokio::join!(watcher_handle, socket_handle, signal_handle);

    tracing::info!("waiting for in-flight syncs");
    scheduler.stop().await;
    let _ = drain_tx.send(());
    let recorder_result = recorder_handle.await;

    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    handle_join("history_recorder", recorder_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// History recorder
// ---------------------------------------------------------------------------

/// Append every finished run to the history file until drained.
async fn recorder_task(
    state: PathBuf,
    mut events: broadcast::Receiver<SyncResult>,
    mut drain: oneshot::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(result) => record(&state, &result).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "history recorder lagged; results dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut drain => {
                loop {
                    match events.try_recv() {
                        Ok(result) => record(&state, &result).await,
                        Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "history recorder lagged; results dropped");
                        }
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }
    Ok(())
}

async fn record(state: &Path, result: &SyncResult) {
    let entry = HistoryRecord::from_result(result);
    let job = entry.job.clone();
    let state = state.to_path_buf();
    match tokio::task::spawn_blocking(move || history::append_at(&state, entry)).await {
        Ok(Ok(())) => tracing::debug!(job = %job, "sync recorded"),
        Ok(Err(err)) => tracing::warn!(job = %job, error = %err, "failed to record sync history"),
        Err(err) => tracing::warn!(job = %job, error = %err, "history write task failed"),
    }
}

// ---------------------------------------------------------------------------
// Config watcher
// ---------------------------------------------------------------------------

/// What the watcher reacts to: YAML files in a directory, or one file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchTarget {
    Dir(PathBuf),
    File(PathBuf),
}

impl WatchTarget {
    fn resolve(config: &Path) -> Result<Self, DaemonError> {
        let canonical = fs::canonicalize(config).map_err(|e| io_err(config, e))?;
        Ok(if canonical.is_dir() {
            WatchTarget::Dir(canonical)
        } else {
            WatchTarget::File(canonical)
        })
    }

    /// Directory registered with the watcher. A single file is watched via
    /// its parent so editors that replace the file are still seen.
    fn watch_dir(&self) -> &Path {
        match self {
            WatchTarget::Dir(dir) => dir,
            WatchTarget::File(file) => file.parent().unwrap_or(file),
        }
    }

    fn matches(&self, path: &Path) -> bool {
        match self {
            WatchTarget::File(file) => path == file,
            WatchTarget::Dir(dir) => {
                path.parent() == Some(dir.as_path())
                    && matches!(
                        path.extension().and_then(|ext| ext.to_str()),
                        Some("yaml") | Some("yml")
                    )
            }
        }
    }
}

/// Trailing-edge debounce: fires once the window passes with no new event.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn watcher_task(
    config_path: PathBuf,
    scheduler: Scheduler,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let target = WatchTarget::resolve(&config_path)?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(target.watch_dir(), RecursiveMode::NonRecursive)?;
    tracing::debug!(path = %target.watch_dir().display(), "watching configuration");

    let mut debounce = Debouncer::new(DEBOUNCE_WINDOW);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = sleep_until_deadline(debounce.deadline()) => {
                if !debounce.take_due(Instant::now()) {
                    continue;
                }
                match reload_jobs(&config_path, &scheduler).await {
                    Ok(report) => tracing::info!(
                        added = report.added.len(),
                        removed = report.removed.len(),
                        rescheduled = report.rescheduled.len(),
                        "configuration change applied",
                    ),
                    Err(err) => tracing::error!(
                        error = %err,
                        "configuration change rejected; keeping current jobs",
                    ),
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if is_relevant_event_kind(&event.kind)
                    && event.paths.iter().any(|path| target.matches(path))
                {
                    debounce.touch(Instant::now());
                }
            }
        }
    }

    Ok(())
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Re-read the configuration and hand the new job list to the scheduler.
///
/// Only the job registry changes; `ssh` and `sync` settings take effect on
/// the next daemon start.
async fn reload_jobs(config_path: &Path, scheduler: &Scheduler) -> Result<ReloadReport, DaemonError> {
    let path = config_path.to_path_buf();
    let settings = tokio::task::spawn_blocking(move || config::load_at(&path))
        .await
        .map_err(|err| DaemonError::Protocol(format!("config reload join error: {err}")))??;
    Ok(scheduler.reload(settings.repositories)?)
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&shared.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let shared = shared.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, shared, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stopping = request == DaemonRequest::Stop;
        let response = match request {
            DaemonRequest::Status => DaemonResponse::ok(build_status_payload(&shared)),
            DaemonRequest::Sync { job, dry_run } => {
                match shared.scheduler.run_once(job.as_ref(), dry_run).await {
                    Ok(outcome) => DaemonResponse::ok(json!(outcome)),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            DaemonRequest::Reload => match reload_jobs(&shared.config, &shared.scheduler).await {
                Ok(report) => DaemonResponse::ok(json!(report)),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            DaemonRequest::Stop => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if stopping {
            break;
        }
    }

    Ok(())
}

fn build_status_payload(shared: &Shared) -> Value {
    let jobs = shared.scheduler.status();
    let last_sync_at = jobs.iter().filter_map(|job| job.last_run_at).max();

    json!({
        "running": true,
        "started_at": shared.started_at,
        "last_sync_at": last_sync_at,
        "config": shared.config.display().to_string(),
        "socket": socket_path(&shared.home).display().to_string(),
        "jobs": jobs,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [state_root(home), history_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
