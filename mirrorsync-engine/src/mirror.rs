//! Per-job bare mirror cache.
//!
//! ## Layout
//!
//! ```text
//! <mirror_cache_dir>/
//!   <job>.git                      (bare mirror, one per job name)
//!   <job>.git.partial              (clone in progress)
//!   <job>.git.corrupt-<timestamp>  (quarantined, kept for inspection)
//! ```
//!
//! Mirrors are keyed by job name, never by URL, so two jobs reading the same
//! source still get separate mirrors. All access to a mirror goes through a
//! [`MirrorGuard`] obtained from [`MirrorStore::lock`]; the guard holds the
//! job's slot in the keyed lock table until it drops.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use mirrorsync_core::JobName;

use crate::credentials::TransportConfig;
use crate::error::{io_err, SyncError};
use crate::gateway::{RefEntry, RepositoryGateway};

/// Location of one job's mirror. Only reachable through a held [`MirrorGuard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorHandle {
    job: JobName,
    path: PathBuf,
}

impl MirrorHandle {
    pub fn job(&self) -> &JobName {
        &self.job
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Mirror cache rooted at `mirror_cache_dir`, plus the keyed lock table.
#[derive(Debug)]
pub struct MirrorStore {
    root: PathBuf,
    locks: Mutex<HashMap<JobName, Arc<AsyncMutex<()>>>>,
    contended: AtomicU64,
}

impl MirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
            contended: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<job>.git`
    pub fn mirror_path(&self, job: &JobName) -> PathBuf {
        self.root.join(format!("{job}.git"))
    }

    /// Wait for exclusive access to `job`'s mirror.
    ///
    /// Different jobs never block each other.
    pub async fn lock(&self, job: &JobName) -> MirrorGuard {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(job.clone()).or_default())
        };

        let held = match Arc::clone(&slot).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job = %job, "waiting for mirror lock");
                slot.lock_owned().await
            }
        };

        MirrorGuard {
            handle: MirrorHandle {
                job: job.clone(),
                path: self.mirror_path(job),
            },
            root: self.root.clone(),
            _held: held,
        }
    }

    /// How many `lock` calls so far had to wait for another holder.
    pub fn contention_count(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}

/// Exclusive access to one job's mirror. Releases on drop.
#[derive(Debug)]
pub struct MirrorGuard {
    handle: MirrorHandle,
    root: PathBuf,
    _held: OwnedMutexGuard<()>,
}

impl MirrorGuard {
    pub fn handle(&self) -> &MirrorHandle {
        &self.handle
    }

    /// Bring the mirror up to date with `source_url`.
    ///
    /// Clones on first use (into `<job>.git.partial`, renamed once complete),
    /// otherwise verifies the existing mirror and fetches incrementally. A
    /// failed or timed-out fetch leaves the existing mirror untouched.
    pub async fn acquire<G>(
        &self,
        gateway: &G,
        source_url: &str,
        transport: &TransportConfig,
    ) -> Result<&MirrorHandle, SyncError>
    where
        G: RepositoryGateway + ?Sized,
    {
        let job = &self.handle.job;
        let path = &self.handle.path;

        if !path.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;
            let partial = self.root.join(format!("{job}.git.partial"));
            if partial.exists() {
                tracing::warn!(job = %job, "removing leftover partial clone");
                std::fs::remove_dir_all(&partial).map_err(|e| io_err(&partial, e))?;
            }

            tracing::info!(job = %job, "cloning mirror");
            if let Err(err) = gateway.clone_mirror(source_url, &partial, transport).await {
                let _ = std::fs::remove_dir_all(&partial);
                return Err(mirror_sync_error(job, err));
            }
            std::fs::rename(&partial, path).map_err(|e| io_err(path, e))?;
            return Ok(&self.handle);
        }

        if !gateway.verify_mirror(path).await? {
            return Err(SyncError::MirrorCorrupt {
                job: job.clone(),
                path: path.clone(),
                detail: "not a readable bare repository".to_string(),
            });
        }

        tracing::debug!(job = %job, "fetching into existing mirror");
        gateway
            .fetch_all_refs(path, source_url, transport)
            .await
            .map_err(|err| mirror_sync_error(job, err))?;
        Ok(&self.handle)
    }

    /// Branches and tags currently in the mirror.
    pub async fn refs<G>(&self, gateway: &G) -> Result<Vec<RefEntry>, SyncError>
    where
        G: RepositoryGateway + ?Sized,
    {
        gateway.list_refs(&self.handle.path).await
    }

    /// Move a corrupt mirror aside so the next `acquire` clones afresh.
    pub fn quarantine(&self) -> Result<PathBuf, SyncError> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let dest = self
            .root
            .join(format!("{}.git.corrupt-{stamp}", self.handle.job));
        std::fs::rename(&self.handle.path, &dest).map_err(|e| io_err(&self.handle.path, e))?;
        tracing::warn!(job = %self.handle.job, quarantined = %dest.display(), "mirror quarantined");
        Ok(dest)
    }
}

/// Timeouts stay distinct; everything else from clone/fetch is a mirror sync failure.
fn mirror_sync_error(job: &JobName, err: SyncError) -> SyncError {
    match err {
        SyncError::Timeout { .. } | SyncError::Io { .. } => err,
        other => SyncError::MirrorSync {
            job: job.clone(),
            detail: other.to_string(),
        },
    }
}
