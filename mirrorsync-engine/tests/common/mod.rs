//! In-memory repository gateway shared by the engine integration tests.
//!
//! Remotes are maps of full ref name → commit, keyed by URL. Mirrors are
//! snapshots of a source remote taken at clone/fetch time, keyed by mirror
//! directory. A commit graph answers ancestry queries.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use mirrorsync_core::{
    CommitId, Credential, CredentialName, Endpoint, HostPolicy, JobName, KeyType, RefKind,
    RepositoryJob,
};
use mirrorsync_engine::{
    CredentialBinder, MirrorStore, Orchestrator, RefEntry, RepositoryGateway, RunOptions, Side,
    SyncError, TransportConfig,
};

pub const CORRUPT_MARKER: &str = "CORRUPT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCall {
    pub url: String,
    pub full_ref: String,
    pub commit: CommitId,
}

#[derive(Default)]
struct FakeState {
    remotes: HashMap<String, BTreeMap<String, CommitId>>,
    mirrors: HashMap<PathBuf, BTreeMap<String, CommitId>>,
    parents: HashMap<CommitId, Vec<CommitId>>,
    pushes: Vec<PushCall>,
    failing_pushes: HashSet<String>,
    unreachable: HashSet<String>,
    panicking: HashSet<String>,
    clones: usize,
    fetches: usize,
    active_per_mirror: HashMap<PathBuf, usize>,
    max_per_mirror: HashMap<PathBuf, usize>,
    active_total: usize,
    max_total: usize,
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
    delay: Mutex<Duration>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record `id` with the given parents in the commit graph.
    pub fn commit(&self, id: &str, parents: &[&str]) {
        self.state().parents.insert(
            CommitId::from(id),
            parents.iter().map(|p| CommitId::from(*p)).collect(),
        );
    }

    pub fn set_ref(&self, url: &str, full_ref: &str, commit: &str) {
        self.state()
            .remotes
            .entry(url.to_string())
            .or_default()
            .insert(full_ref.to_string(), CommitId::from(commit));
    }

    pub fn remote(&self, url: &str) -> BTreeMap<String, CommitId> {
        self.state().remotes.get(url).cloned().unwrap_or_default()
    }

    pub fn fail_push(&self, full_ref: &str) {
        self.state().failing_pushes.insert(full_ref.to_string());
    }

    pub fn make_unreachable(&self, url: &str) {
        self.state().unreachable.insert(url.to_string());
    }

    pub fn make_reachable(&self, url: &str) {
        self.state().unreachable.remove(url);
    }

    pub fn panic_on_fetch(&self, url: &str) {
        self.state().panicking.insert(url.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    pub fn pushes(&self) -> Vec<PushCall> {
        self.state().pushes.clone()
    }

    pub fn clones(&self) -> usize {
        self.state().clones
    }

    pub fn fetches(&self) -> usize {
        self.state().fetches
    }

    /// Highest number of simultaneous mirror operations seen on one mirror.
    pub fn max_concurrent_on(&self, mirror: &Path) -> usize {
        self.state()
            .max_per_mirror
            .get(&mirror_key(mirror))
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneous mirror operations seen overall.
    pub fn max_concurrent_total(&self) -> usize {
        self.state().max_total
    }

    async fn busy(&self, mirror: &Path) {
        let key = mirror_key(mirror);
        {
            let mut st = self.state();
            let active = st.active_per_mirror.entry(key.clone()).or_default();
            *active += 1;
            let now = *active;
            let max = st.max_per_mirror.entry(key.clone()).or_default();
            *max = (*max).max(now);
            st.active_total += 1;
            st.max_total = st.max_total.max(st.active_total);
        }
        let delay = *self.delay.lock().unwrap_or_else(|p| p.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut st = self.state();
        if let Some(active) = st.active_per_mirror.get_mut(&key) {
            *active -= 1;
        }
        st.active_total -= 1;
    }

    fn snapshot(&self, url: &str, mirror: &Path) -> Result<(), SyncError> {
        let mut st = self.state();
        if st.unreachable.contains(url) {
            return Err(SyncError::Transport {
                side: Side::Source,
                detail: format!("Could not read from remote repository: {url}"),
            });
        }
        let refs = st.remotes.get(url).cloned().unwrap_or_default();
        st.mirrors.insert(mirror_key(mirror), refs);
        Ok(())
    }

    fn reachable(&self, ancestor: &CommitId, descendant: &CommitId) -> bool {
        let st = self.state();
        let mut queue = VecDeque::from([descendant.clone()]);
        let mut seen = HashSet::new();
        while let Some(c) = queue.pop_front() {
            if &c == ancestor {
                return true;
            }
            if !seen.insert(c.clone()) {
                continue;
            }
            if let Some(parents) = st.parents.get(&c) {
                queue.extend(parents.iter().cloned());
            }
        }
        false
    }
}

/// `<job>.git.partial` and `<job>.git` refer to the same logical mirror.
fn mirror_key(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(raw.strip_suffix(".partial").unwrap_or(&raw))
}

#[async_trait]
impl RepositoryGateway for FakeGateway {
    async fn clone_mirror(
        &self,
        url: &str,
        dest: &Path,
        _transport: &TransportConfig,
    ) -> Result<(), SyncError> {
        if self.state().panicking.contains(url) {
            panic!("fake gateway asked to panic for {url}");
        }
        self.busy(dest).await;
        self.snapshot(url, dest)?;
        std::fs::create_dir_all(dest).expect("create fake mirror dir");
        self.state().clones += 1;
        Ok(())
    }

    async fn fetch_all_refs(
        &self,
        mirror: &Path,
        url: &str,
        _transport: &TransportConfig,
    ) -> Result<(), SyncError> {
        if self.state().panicking.contains(url) {
            panic!("fake gateway asked to panic for {url}");
        }
        self.busy(mirror).await;
        self.snapshot(url, mirror)?;
        self.state().fetches += 1;
        Ok(())
    }

    async fn verify_mirror(&self, mirror: &Path) -> Result<bool, SyncError> {
        Ok(mirror.is_dir() && !mirror.join(CORRUPT_MARKER).exists())
    }

    async fn list_refs(&self, mirror: &Path) -> Result<Vec<RefEntry>, SyncError> {
        let st = self.state();
        let refs = st.mirrors.get(&mirror_key(mirror)).cloned().unwrap_or_default();
        Ok(refs
            .into_iter()
            .filter_map(|(full, commit)| {
                let (kind, name) = if let Some(n) = full.strip_prefix("refs/heads/") {
                    (RefKind::Branch, n)
                } else {
                    (RefKind::Tag, full.strip_prefix("refs/tags/")?)
                };
                Some(RefEntry {
                    name: name.to_string(),
                    kind,
                    commit,
                })
            })
            .collect())
    }

    async fn is_ancestor(
        &self,
        _mirror: &Path,
        ancestor: &CommitId,
        descendant: &CommitId,
    ) -> Result<bool, SyncError> {
        Ok(self.reachable(ancestor, descendant))
    }

    async fn remote_ref(
        &self,
        url: &str,
        _transport: &TransportConfig,
        full_ref: &str,
    ) -> Result<Option<CommitId>, SyncError> {
        Ok(self
            .state()
            .remotes
            .get(url)
            .and_then(|refs| refs.get(full_ref))
            .cloned())
    }

    async fn push_ref(
        &self,
        _mirror: &Path,
        url: &str,
        _transport: &TransportConfig,
        full_ref: &str,
        commit: &CommitId,
    ) -> Result<(), SyncError> {
        if self.state().failing_pushes.contains(full_ref) {
            return Err(SyncError::Transport {
                side: Side::Target,
                detail: "Connection refused".to_string(),
            });
        }
        let current = self.remote(url).get(full_ref).cloned();
        if let Some(current) = current {
            // Mirrors the remote refusing a non-fast-forward update.
            assert!(
                self.reachable(&current, commit),
                "non-fast-forward push of {full_ref} reached the gateway"
            );
        }
        let mut st = self.state();
        st.remotes
            .entry(url.to_string())
            .or_default()
            .insert(full_ref.to_string(), commit.clone());
        st.pushes.push(PushCall {
            url: url.to_string(),
            full_ref: full_ref.to_string(),
            commit: commit.clone(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn binder() -> CredentialBinder {
    let creds: HashMap<CredentialName, Credential> = ["gh", "gl"]
        .into_iter()
        .map(|name| {
            (
                CredentialName::from(name),
                Credential {
                    name: CredentialName::from(name),
                    key_type: KeyType::Ed25519,
                    key_path: PathBuf::from(format!("/keys/{name}")),
                    host_policy: HostPolicy::Strict,
                },
            )
        })
        .collect();
    CredentialBinder::new(Arc::new(creds))
}

pub fn src_url(job: &str) -> String {
    format!("git@source.example:acme/{job}.git")
}

pub fn dst_url(job: &str) -> String {
    format!("git@target.example:acme/{job}.git")
}

pub fn job(name: &str) -> RepositoryJob {
    RepositoryJob {
        name: JobName::from(name),
        source: Endpoint {
            url: src_url(name),
            ssh_key: CredentialName::from("gh"),
        },
        target: Endpoint {
            url: dst_url(name),
            ssh_key: CredentialName::from("gl"),
        },
        enabled: true,
        sync_branches: Vec::new(),
        sync_tags: true,
        auto_sync_enabled: false,
        auto_sync_interval: 3600,
    }
}

pub fn orchestrator(gateway: &Arc<FakeGateway>, root: &Path) -> Orchestrator {
    Orchestrator::new(
        Arc::clone(gateway) as Arc<dyn RepositoryGateway>,
        binder(),
        Arc::new(MirrorStore::new(root.join("mirrors"))),
        RunOptions {
            temp_dir: root.join("tmp"),
            cleanup_after_sync: true,
        },
    )
}
