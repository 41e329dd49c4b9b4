//! Job registry, concurrent batches and recurring triggers.
//!
//! A [`Scheduler`] owns the current set of jobs, one trigger task per
//! auto-synced job, and a per-job status table. It is a cheap handle: clones
//! share the same registry.
//!
//! ## Overlap rules
//!
//! - An ad hoc [`Scheduler::run_once`] for a job that is already syncing
//!   queues behind the job's mirror lock.
//! - A trigger tick that arrives while the job is still syncing is skipped and
//!   logged. Trigger loops await each run and use
//!   [`MissedTickBehavior::Skip`], so ticks never pile up.
//!
//! All runs share one semaphore sized by `max_parallel_jobs`. A run takes its
//! job's mirror lock before its permit, so a run queued behind another run of
//! the same job never holds a permit another job could use.
//!
//! Once [`Scheduler::stop`] has begun, new runs are refused with
//! [`SchedulerError::Stopped`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use mirrorsync_core::{JobName, RepositoryJob, Settings, SyncBatchSummary, SyncResult};

use crate::error::SchedulerError;
use crate::orchestrator::Orchestrator;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Scheduled,
    Running,
    Disabled,
}

/// One row of [`Scheduler::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job: JobName,
    pub state: JobState,
    pub enabled: bool,
    /// Seconds between recurring runs, when auto-sync is on.
    pub interval_secs: Option<u64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success: Option<bool>,
    /// Trigger ticks dropped because the job was still syncing.
    pub skipped_ticks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Single(SyncResult),
    Batch(SyncBatchSummary),
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        match self {
            RunOutcome::Single(result) => result.success,
            RunOutcome::Batch(summary) => summary.failed == 0,
        }
    }

    pub fn results(&self) -> &[SyncResult] {
        match self {
            RunOutcome::Single(result) => std::slice::from_ref(result),
            RunOutcome::Batch(summary) => &summary.results,
        }
    }
}

/// What a [`Scheduler::reload`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub added: Vec<JobName>,
    pub removed: Vec<JobName>,
    /// Jobs whose trigger was started, stopped or restarted.
    pub rescheduled: Vec<JobName>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Trigger {
    interval: Duration,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Runtime {
    running: usize,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    last_success: Option<bool>,
    skipped_ticks: u64,
}

#[derive(Default)]
struct State {
    jobs: Vec<RepositoryJob>,
    triggers: HashMap<JobName, Trigger>,
    runtime: HashMap<JobName, Runtime>,
    started: bool,
    stopping: bool,
}

impl State {
    fn job(&self, name: &JobName) -> Option<&RepositoryJob> {
        self.jobs.iter().find(|j| &j.name == name)
    }
}

struct Inner {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    state: Mutex<State>,
    active: AtomicUsize,
    idle: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Marks a job as running for as long as it lives, including through panics.
struct RunGuard {
    inner: Arc<Inner>,
    job: JobName,
}

impl RunGuard {
    /// Callers check `state.stopping` under the same lock first.
    fn enter(inner: &Arc<Inner>, state: &mut State, job: &JobName) -> Self {
        inner.active.fetch_add(1, Ordering::SeqCst);
        state.runtime.entry(job.clone()).or_default().running += 1;
        Self {
            inner: Arc::clone(inner),
            job: job.clone(),
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(rt) = self.inner.state().runtime.get_mut(&self.job) {
            rt.running = rt.running.saturating_sub(1);
        }
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        jobs: Vec<RepositoryJob>,
        max_parallel_jobs: usize,
    ) -> Result<Self, SchedulerError> {
        check_jobs(&jobs)?;
        let runtime = jobs
            .iter()
            .map(|j| (j.name.clone(), Runtime::default()))
            .collect();
        Ok(Self {
            inner: Arc::new(Inner {
                orchestrator,
                permits: Arc::new(Semaphore::new(max_parallel_jobs.max(1))),
                state: Mutex::new(State {
                    jobs,
                    runtime,
                    ..State::default()
                }),
                active: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }

    /// Build the git-backed orchestrator and registry from configuration.
    pub fn from_settings(settings: &Settings) -> Result<Self, SchedulerError> {
        Self::new(
            Arc::new(Orchestrator::from_settings(settings)),
            settings.repositories.clone(),
            settings.sync.max_parallel_jobs,
        )
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.inner.orchestrator
    }

    pub fn jobs(&self) -> Vec<RepositoryJob> {
        self.inner.state().jobs.clone()
    }

    /// Run one named job, or every enabled job when `job` is `None`.
    ///
    /// A named job runs whether or not it is enabled or auto-synced.
    pub async fn run_once(
        &self,
        job: Option<&JobName>,
        dry_run: bool,
    ) -> Result<RunOutcome, SchedulerError> {
        match job {
            Some(name) => {
                let (job, running) = {
                    let mut state = self.inner.state();
                    if state.stopping {
                        return Err(SchedulerError::Stopped);
                    }
                    let job = state
                        .job(name)
                        .cloned()
                        .ok_or_else(|| SchedulerError::UnknownJob(name.clone()))?;
                    let running = RunGuard::enter(&self.inner, &mut state, name);
                    (job, running)
                };
                let handle = spawn_run(&self.inner, running, job.clone(), dry_run);
                Ok(RunOutcome::Single(join_run(&job, dry_run, handle).await))
            }
            None => Ok(RunOutcome::Batch(self.run_batch(dry_run).await?)),
        }
    }

    async fn run_batch(&self, dry_run: bool) -> Result<SyncBatchSummary, SchedulerError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let admitted: Vec<(RepositoryJob, RunGuard)> = {
            let mut state = self.inner.state();
            if state.stopping {
                return Err(SchedulerError::Stopped);
            }
            let jobs: Vec<RepositoryJob> =
                state.jobs.iter().filter(|j| j.enabled).cloned().collect();
            jobs.into_iter()
                .map(|job| {
                    let running = RunGuard::enter(&self.inner, &mut state, &job.name);
                    (job, running)
                })
                .collect()
        };
        tracing::info!(jobs = admitted.len(), dry_run, "batch sync started");

        let handles: Vec<_> = admitted
            .into_iter()
            .map(|(job, running)| {
                let handle = spawn_run(&self.inner, running, job.clone(), dry_run);
                (job, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (job, handle) in handles {
            results.push(join_run(&job, dry_run, handle).await);
        }

        let summary = SyncBatchSummary::from_results(results, started_at, Utc::now(), clock.elapsed());
        tracing::info!(
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            "batch sync finished"
        );
        Ok(summary)
    }

    /// Start a trigger for every auto-synced job.
    ///
    /// Does nothing on a scheduler that has been stopped.
    pub fn start(&self) {
        let mut state = self.inner.state();
        if state.started || state.stopping {
            return;
        }
        state.started = true;
        let jobs: Vec<_> = state
            .jobs
            .iter()
            .filter(|j| j.auto_sync().enabled)
            .cloned()
            .collect();
        for job in jobs {
            spawn_trigger(&self.inner, &mut state, &job);
        }
        tracing::info!(triggers = state.triggers.len(), "scheduler started");
    }

    /// Refuse new runs, cancel every trigger and wait for all in-flight runs
    /// to finish.
    pub async fn stop(&self) {
        let triggers: Vec<Trigger> = {
            let mut state = self.inner.state();
            state.started = false;
            state.stopping = true;
            for rt in state.runtime.values_mut() {
                rt.next_run_at = None;
            }
            state.triggers.drain().map(|(_, t)| t).collect()
        };
        for trigger in &triggers {
            let _ = trigger.cancel.send(true);
        }
        for trigger in triggers {
            if let Err(err) = trigger.handle.await {
                tracing::error!(error = %err, "trigger task ended abnormally");
            }
        }

        loop {
            let idle = self.inner.idle.notified();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }
        tracing::info!("scheduler stopped");
    }

    /// Replace the job set.
    ///
    /// Triggers of removed or no-longer-auto-synced jobs are cancelled, jobs
    /// whose interval changed are rescheduled, every other trigger is left
    /// running and picks up the new definition on its next tick.
    pub fn reload(&self, jobs: Vec<RepositoryJob>) -> Result<ReloadReport, SchedulerError> {
        check_jobs(&jobs)?;
        let mut state = self.inner.state();
        let mut report = ReloadReport::default();

        let incoming: HashSet<&JobName> = jobs.iter().map(|j| &j.name).collect();
        report.removed = state
            .jobs
            .iter()
            .filter(|j| !incoming.contains(&j.name))
            .map(|j| j.name.clone())
            .collect();
        report.added = jobs
            .iter()
            .filter(|j| state.job(&j.name).is_none())
            .map(|j| j.name.clone())
            .collect();

        for name in &report.removed {
            state.runtime.remove(name);
            if let Some(trigger) = state.triggers.remove(name) {
                cancel(trigger);
                report.rescheduled.push(name.clone());
            }
        }

        for job in &jobs {
            state.runtime.entry(job.name.clone()).or_default();
            let auto = job.auto_sync();
            let current = state.triggers.get(&job.name).map(|t| t.interval);
            let keep = match current {
                Some(interval) => auto.enabled && interval == auto.interval,
                None => !auto.enabled,
            };
            if keep {
                continue;
            }
            if let Some(trigger) = state.triggers.remove(&job.name) {
                cancel(trigger);
                if let Some(rt) = state.runtime.get_mut(&job.name) {
                    rt.next_run_at = None;
                }
            }
            if auto.enabled && state.started {
                spawn_trigger(&self.inner, &mut state, job);
            }
            if current.is_some() || state.started {
                report.rescheduled.push(job.name.clone());
            }
        }

        state.jobs = jobs;
        tracing::info!(
            added = report.added.len(),
            removed = report.removed.len(),
            rescheduled = report.rescheduled.len(),
            "jobs reloaded"
        );
        Ok(report)
    }

    /// Per-job state, in configuration order.
    pub fn status(&self) -> Vec<JobStatus> {
        let state = self.inner.state();
        state
            .jobs
            .iter()
            .map(|job| {
                let rt = state.runtime.get(&job.name);
                let trigger = state.triggers.get(&job.name);
                let running = rt.is_some_and(|r| r.running > 0);
                JobStatus {
                    job: job.name.clone(),
                    state: if running {
                        JobState::Running
                    } else if trigger.is_some() {
                        JobState::Scheduled
                    } else {
                        JobState::Disabled
                    },
                    enabled: job.enabled,
                    interval_secs: trigger.map(|t| t.interval.as_secs()),
                    next_run_at: rt.and_then(|r| r.next_run_at),
                    last_run_at: rt.and_then(|r| r.last_run_at),
                    last_success: rt.and_then(|r| r.last_success),
                    skipped_ticks: rt.map_or(0, |r| r.skipped_ticks),
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

fn spawn_run(
    inner: &Arc<Inner>,
    running: RunGuard,
    job: RepositoryJob,
    dry_run: bool,
) -> JoinHandle<SyncResult> {
    let inner = Arc::clone(inner);
    tokio::spawn(async move { execute(&inner, running, &job, dry_run).await })
}

async fn execute(
    inner: &Arc<Inner>,
    _running: RunGuard,
    job: &RepositoryJob,
    dry_run: bool,
) -> SyncResult {
    let mirror = inner.orchestrator.mirrors().lock(&job.name).await;
    let _permit = Arc::clone(&inner.permits).acquire_owned().await.ok();

    let result = inner.orchestrator.run_locked(job, dry_run, mirror).await;

    if !dry_run {
        if let Some(rt) = inner.state().runtime.get_mut(&job.name) {
            rt.last_run_at = Some(result.started_at);
            rt.last_success = Some(result.success);
        }
    }
    result
}

/// Turn a panicked or cancelled run into a failed result.
async fn join_run(job: &RepositoryJob, dry_run: bool, handle: JoinHandle<SyncResult>) -> SyncResult {
    let started_at = Utc::now();
    match handle.await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(job = %job.name, error = %err, "sync task failed");
            SyncResult {
                job: job.name.clone(),
                success: false,
                dry_run,
                decisions: Vec::new(),
                started_at,
                duration_ms: 0,
                error: Some(format!("sync task failed: {err}")),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

fn spawn_trigger(inner: &Arc<Inner>, state: &mut State, job: &RepositoryJob) {
    let interval = job.auto_sync().interval;
    let (cancel, cancelled) = watch::channel(false);
    let handle = tokio::spawn(trigger_loop(
        Arc::downgrade(inner),
        job.name.clone(),
        interval,
        cancelled,
    ));
    if let Some(rt) = state.runtime.get_mut(&job.name) {
        rt.next_run_at = Some(Utc::now() + chrono_duration(interval));
    }
    tracing::debug!(job = %job.name, interval_secs = interval.as_secs(), "trigger scheduled");
    state.triggers.insert(
        job.name.clone(),
        Trigger {
            interval,
            cancel,
            handle,
        },
    );
}

fn cancel(trigger: Trigger) {
    let _ = trigger.cancel.send(true);
}

async fn trigger_loop(
    inner: Weak<Inner>,
    name: JobName,
    interval: Duration,
    mut cancelled: watch::Receiver<bool>,
) {
    let first = Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(first, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // End of this trigger's last run; ticks due before it were already counted as skipped.
    let mut busy_until: Option<Instant> = None;

    loop {
        let due = tokio::select! {
            _ = cancelled.changed() => break,
            due = ticker.tick() => due,
        };
        if *cancelled.borrow() {
            break;
        }
        if busy_until.is_some_and(|end| due < end) {
            continue;
        }
        let Some(strong) = inner.upgrade() else { break };

        let (job, running) = {
            let mut state = strong.state();
            if state.stopping {
                break;
            }
            let Some(job) = state.job(&name).cloned() else { break };
            let rt = state.runtime.entry(name.clone()).or_default();
            rt.next_run_at = Some(wall_clock(due + interval));
            if rt.running > 0 {
                rt.skipped_ticks += 1;
                tracing::info!(job = %name, "previous run still in progress, skipping tick");
                continue;
            }
            let running = RunGuard::enter(&strong, &mut state, &name);
            (job, running)
        };

        let clock = Instant::now();
        let result = execute(&strong, running, &job, false).await;
        let end = Instant::now();
        busy_until = Some(end);
        let missed = (clock.elapsed().as_nanos() / interval.as_nanos().max(1)) as u64;
        {
            let mut state = strong.state();
            let rescheduled = !state.stopping && !*cancelled.borrow();
            if let Some(rt) = state.runtime.get_mut(&name) {
                rt.skipped_ticks += missed;
                if rescheduled {
                    rt.next_run_at = Some(wall_clock(next_deadline(first, interval, end)));
                }
            }
        }
        if missed > 0 {
            tracing::info!(job = %name, missed, "run outlasted its interval, ticks skipped");
        }
        if !result.success {
            tracing::warn!(job = %name, error = ?result.error, "scheduled sync failed");
        }
    }
    tracing::debug!(job = %name, "trigger stopped");
}

/// The first tick of the schedule `first + k * interval` due at or after `now`.
fn next_deadline(first: Instant, interval: Duration, now: Instant) -> Instant {
    if now <= first {
        return first;
    }
    let period = interval.as_nanos().max(1);
    let into = (now - first).as_nanos() % period;
    if into == 0 {
        now
    } else {
        now + Duration::from_nanos(u64::try_from(period - into).unwrap_or(u64::MAX))
    }
}

fn wall_clock(at: Instant) -> DateTime<Utc> {
    Utc::now() + chrono_duration(at.saturating_duration_since(Instant::now()))
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// Names must be unique and usable as a mirror directory name.
fn check_jobs(jobs: &[RepositoryJob]) -> Result<(), SchedulerError> {
    let mut seen = HashSet::new();
    for job in jobs {
        if !job.name.is_valid() {
            return Err(SchedulerError::InvalidJobName(job.name.clone()));
        }
        if !seen.insert(&job.name) {
            return Err(SchedulerError::DuplicateJob(job.name.clone()));
        }
    }
    Ok(())
}
