//! One job's sync run.
//!
//! ## Run protocol
//!
//! 1. Lock the job's mirror (callers may take the lock themselves and hand
//!    the guard to [`Orchestrator::run_locked`]).
//! 2. Bind the source and target credentials, then bring the mirror up to
//!    date (abort on failure; a corrupt mirror is quarantined so the next
//!    attempt rebuilds it).
//! 3. Enumerate mirror refs and apply the job's branch/tag policy.
//! 4. Per ref, in order: read the target's value, run the fast-forward guard,
//!    push when allowed and not a dry run. A failing ref never stops its
//!    siblings.
//! 5. Aggregate into a [`SyncResult`], publish it on the event channel and
//!    remove the per-run scratch directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::Instrument;

use mirrorsync_core::{RefDecision, RefKind, RefOutcome, RepositoryJob, Settings, SyncResult};

use crate::credentials::{CredentialBinder, KeyDirStore, TransportConfig};
use crate::error::{io_err, SyncError};
use crate::gateway::{GitCli, RefEntry, RepositoryGateway};
use crate::guard::{self, NOT_FOUND};
use crate::mirror::{MirrorGuard, MirrorStore};

/// Buffered results per subscriber before slow receivers start lagging.
const EVENT_CAPACITY: usize = 256;

/// Per-run filesystem behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Parent of the per-run scratch directories.
    pub temp_dir: PathBuf,
    pub cleanup_after_sync: bool,
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            temp_dir: settings.sync.temp_dir.clone(),
            cleanup_after_sync: settings.sync.cleanup_after_sync,
        }
    }
}

/// Runs sync attempts for individual jobs.
pub struct Orchestrator {
    gateway: Arc<dyn RepositoryGateway>,
    binder: CredentialBinder,
    mirrors: Arc<MirrorStore>,
    options: RunOptions,
    events: broadcast::Sender<SyncResult>,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn RepositoryGateway>,
        binder: CredentialBinder,
        mirrors: Arc<MirrorStore>,
        options: RunOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            gateway,
            binder,
            mirrors,
            options,
            events,
        }
    }

    /// Wire up the real git gateway and key directory from configuration.
    pub fn from_settings(settings: &Settings) -> Self {
        let gateway = Arc::new(GitCli::new(settings.sync.timeout()));
        let store = KeyDirStore::new(&settings.ssh.key_storage, settings.ssh.default_key_type);
        Self::new(
            gateway,
            CredentialBinder::new(Arc::new(store)),
            Arc::new(MirrorStore::new(&settings.sync.mirror_cache_dir)),
            RunOptions::from_settings(settings),
        )
    }

    /// Receive every [`SyncResult`] produced from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncResult> {
        self.events.subscribe()
    }

    pub fn mirrors(&self) -> &Arc<MirrorStore> {
        &self.mirrors
    }

    /// Sync one job. Job-level failures are reported inside the result.
    pub async fn run(&self, job: &RepositoryJob, dry_run: bool) -> SyncResult {
        let span = tracing::info_span!("sync", job = %job.name, dry_run);
        async {
            let mirror = self.mirrors.lock(&job.name).await;
            self.run_inner(job, dry_run, mirror).await
        }
        .instrument(span)
        .await
    }

    /// Sync one job whose mirror lock the caller already holds.
    ///
    /// `mirror` must come from [`MirrorStore::lock`] on this orchestrator's
    /// store for `job`.
    pub async fn run_locked(
        &self,
        job: &RepositoryJob,
        dry_run: bool,
        mirror: MirrorGuard,
    ) -> SyncResult {
        debug_assert_eq!(mirror.handle().job(), &job.name);
        let span = tracing::info_span!("sync", job = %job.name, dry_run);
        self.run_inner(job, dry_run, mirror).instrument(span).await
    }

    async fn run_inner(
        &self,
        job: &RepositoryJob,
        dry_run: bool,
        mirror: MirrorGuard,
    ) -> SyncResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!("sync started");

        let (decisions, error) = match self.execute(job, dry_run, started_at, mirror).await {
            Ok(decisions) => (decisions, None),
            Err(err) => {
                tracing::error!(error = %err, retryable = err.is_retryable(), "sync aborted");
                (Vec::new(), Some(err.to_string()))
            }
        };

        let success = error.is_none() && decisions.iter().all(|d| d.outcome != RefOutcome::Failed);
        let result = SyncResult {
            job: job.name.clone(),
            success,
            dry_run,
            decisions,
            started_at,
            duration_ms: clock.elapsed().as_millis(),
            error,
        };

        tracing::info!(
            success,
            pushed = result.count(RefOutcome::Pushed),
            failed = result.count(RefOutcome::Failed),
            duration_ms = result.duration_ms as u64,
            "sync finished"
        );
        // No subscribers is fine.
        let _ = self.events.send(result.clone());
        result
    }

    async fn execute(
        &self,
        job: &RepositoryJob,
        dry_run: bool,
        started_at: DateTime<Utc>,
        mirror: MirrorGuard,
    ) -> Result<Vec<RefDecision>, SyncError> {
        let source = self.binder.bind(&job.source.ssh_key)?;
        let target = self.binder.bind(&job.target.ssh_key)?;

        let scratch = self.scratch_dir(job, started_at);
        std::fs::create_dir_all(&scratch).map_err(|e| io_err(&scratch, e))?;

        let outcome = self
            .sync_refs(
                job,
                &mirror,
                &source.with_env("TMPDIR", scratch.as_os_str()),
                &target.with_env("TMPDIR", scratch.as_os_str()),
                dry_run,
            )
            .await;

        if self.options.cleanup_after_sync {
            if let Err(err) = std::fs::remove_dir_all(&scratch) {
                tracing::warn!(path = %scratch.display(), error = %err, "could not remove scratch dir");
            }
        }
        outcome
    }

    async fn sync_refs(
        &self,
        job: &RepositoryJob,
        mirror: &MirrorGuard,
        source: &TransportConfig,
        target: &TransportConfig,
        dry_run: bool,
    ) -> Result<Vec<RefDecision>, SyncError> {
        let gateway = self.gateway.as_ref();
        match mirror.acquire(gateway, &job.source.url, source).await {
            Ok(_) => {}
            Err(err @ SyncError::MirrorCorrupt { .. }) => {
                if let Err(q) = mirror.quarantine() {
                    tracing::error!(error = %q, "could not quarantine corrupt mirror");
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        let refs = mirror.refs(gateway).await?;
        let mut decisions = Vec::new();
        for selected in select_refs(job, refs) {
            let decision = match selected {
                Selected::Missing(name) => RefDecision {
                    name,
                    kind: RefKind::Branch,
                    outcome: RefOutcome::SkippedFiltered,
                    reason: NOT_FOUND.to_string(),
                    source_commit: None,
                    target_commit: None,
                },
                Selected::Present(entry) => {
                    match self.sync_ref(job, mirror.handle().path(), &entry, target, dry_run).await {
                        Ok(decision) => decision,
                        Err(err) => {
                            tracing::warn!(ref_name = %entry.name, error = %err, "ref failed");
                            RefDecision {
                                name: entry.name,
                                kind: entry.kind,
                                outcome: RefOutcome::Failed,
                                reason: err.to_string(),
                                source_commit: Some(entry.commit),
                                target_commit: None,
                            }
                        }
                    }
                }
            };
            tracing::info!(
                ref_name = %decision.name,
                kind = %decision.kind,
                outcome = %decision.outcome,
                reason = %decision.reason,
                "ref decided"
            );
            decisions.push(decision);
        }
        Ok(decisions)
    }

    async fn sync_ref(
        &self,
        job: &RepositoryJob,
        mirror: &Path,
        entry: &RefEntry,
        target: &TransportConfig,
        dry_run: bool,
    ) -> Result<RefDecision, SyncError> {
        let gateway = self.gateway.as_ref();
        let full_ref = entry.full_name();
        let current = gateway.remote_ref(&job.target.url, target, &full_ref).await?;

        let kind = entry.kind;
        let verdict = guard::decide(&entry.commit, current.as_ref(), |ancestor, descendant| async move {
            match kind {
                // git will not move an existing tag without force.
                RefKind::Tag => Ok(false),
                RefKind::Branch => gateway.is_ancestor(mirror, &ancestor, &descendant).await,
            }
        })
        .await?;

        if verdict.should_push() && !dry_run {
            gateway
                .push_ref(mirror, &job.target.url, target, &full_ref, &entry.commit)
                .await?;
        }

        Ok(RefDecision {
            name: entry.name.clone(),
            kind: entry.kind,
            outcome: verdict.outcome(),
            reason: verdict.reason().to_string(),
            source_commit: Some(entry.commit.clone()),
            target_commit: current,
        })
    }

    /// `<temp_dir>/<job>_<YYYYmmdd_HHMMSS>`
    fn scratch_dir(&self, job: &RepositoryJob, started_at: DateTime<Utc>) -> PathBuf {
        self.options
            .temp_dir
            .join(format!("{}_{}", job.name, started_at.format("%Y%m%d_%H%M%S")))
    }
}

enum Selected {
    Present(RefEntry),
    Missing(String),
}

/// Apply the job's ref policy to the mirror's refs.
///
/// Explicit branches come out in configured order; with no explicit list every
/// branch is taken. Tags follow the branches.
fn select_refs(job: &RepositoryJob, refs: Vec<RefEntry>) -> Vec<Selected> {
    let policy = job.ref_policy();
    let (branches, tags): (Vec<_>, Vec<_>) =
        refs.into_iter().partition(|r| r.kind == RefKind::Branch);

    let mut selected: Vec<Selected> = if policy.branches.is_empty() {
        branches.into_iter().map(Selected::Present).collect()
    } else {
        policy
            .branches
            .iter()
            .map(|wanted| {
                branches
                    .iter()
                    .find(|b| &b.name == wanted)
                    .cloned()
                    .map_or_else(|| Selected::Missing(wanted.clone()), Selected::Present)
            })
            .collect()
    };

    if policy.tags {
        selected.extend(tags.into_iter().map(Selected::Present));
    }
    selected
}
