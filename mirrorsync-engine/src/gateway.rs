//! Typed access to the git operations a sync needs.
//!
//! [`RepositoryGateway`] is the seam between orchestration and subprocesses:
//! the orchestrator and the mirror store only ever talk to this trait, and
//! [`GitCli`] is the one implementation that spawns `git`. Every call is
//! bounded by a timeout; a timed-out child is killed when its future drops.
//!
//! There is no way to force a push through this trait. `push_ref` always sends
//! the plain refspec `<commit>:<ref>`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use mirrorsync_core::{CommitId, RefKind};

use crate::credentials::TransportConfig;
use crate::error::{io_err, Side, SyncError};

/// One branch or tag in a local mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    /// Short name, e.g. `main` or `v1.0`.
    pub name: String,
    pub kind: RefKind,
    pub commit: CommitId,
}

impl RefEntry {
    pub fn full_name(&self) -> String {
        self.kind.full_name(&self.name)
    }
}

#[async_trait]
pub trait RepositoryGateway: Send + Sync + 'static {
    /// Full `clone --mirror` of `url` into `dest` (which must not exist).
    async fn clone_mirror(
        &self,
        url: &str,
        dest: &Path,
        transport: &TransportConfig,
    ) -> Result<(), SyncError>;

    /// Point `origin` at `url` and fetch every ref, pruning deleted ones.
    async fn fetch_all_refs(
        &self,
        mirror: &Path,
        url: &str,
        transport: &TransportConfig,
    ) -> Result<(), SyncError>;

    /// `Ok(false)` when `mirror` is not a readable bare repository.
    async fn verify_mirror(&self, mirror: &Path) -> Result<bool, SyncError>;

    /// Every `refs/heads/*` and `refs/tags/*` in the mirror. Local only.
    async fn list_refs(&self, mirror: &Path) -> Result<Vec<RefEntry>, SyncError>;

    /// Whether `ancestor` is reachable from `descendant`.
    ///
    /// Answers `false` when `ancestor` is not present in the mirror at all.
    async fn is_ancestor(
        &self,
        mirror: &Path,
        ancestor: &CommitId,
        descendant: &CommitId,
    ) -> Result<bool, SyncError>;

    /// Current value of `full_ref` on the remote, `None` when absent.
    async fn remote_ref(
        &self,
        url: &str,
        transport: &TransportConfig,
        full_ref: &str,
    ) -> Result<Option<CommitId>, SyncError>;

    /// Non-forced push of `commit` to `full_ref` on `url`.
    async fn push_ref(
        &self,
        mirror: &Path,
        url: &str,
        transport: &TransportConfig,
        full_ref: &str,
        commit: &CommitId,
    ) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// GitCli
// ---------------------------------------------------------------------------

/// stderr fragments that mean the remote could not be reached or refused us.
const TRANSPORT_MARKERS: &[&str] = &[
    "Permission denied",
    "Could not read from remote repository",
    "Authentication failed",
    "Host key verification failed",
    "Could not resolve host",
    "Connection refused",
    "Connection timed out",
    "does not appear to be a git repository",
    "Repository not found",
];

/// [`RepositoryGateway`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: PathBuf::from("git"),
            timeout,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Spawn git and wait for it, bounded by the configured timeout.
    ///
    /// A non-zero exit is not an error here; callers interpret the status.
    async fn exec<I, S>(
        &self,
        operation: &'static str,
        args: I,
        cwd: Option<&Path>,
        transport: Option<&TransportConfig>,
    ) -> Result<Output, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        if let Some(transport) = transport {
            transport.apply(&mut cmd);
        }

        tracing::debug!(operation, ?transport, "running git");
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| io_err(&self.program, e)),
            Err(_elapsed) => {
                tracing::warn!(operation, after_secs = self.timeout.as_secs(), "git timed out");
                Err(SyncError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }

    /// `exec` plus mapping of a non-zero exit into a typed error.
    async fn run<I, S>(
        &self,
        operation: &'static str,
        args: I,
        cwd: Option<&Path>,
        transport: Option<&TransportConfig>,
        side: Option<Side>,
    ) -> Result<String, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.exec(operation, args, cwd, transport).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(classify_failure(
            operation,
            side,
            output.status.code().unwrap_or(-1),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

#[async_trait]
impl RepositoryGateway for GitCli {
    async fn clone_mirror(
        &self,
        url: &str,
        dest: &Path,
        transport: &TransportConfig,
    ) -> Result<(), SyncError> {
        let args: [&OsStr; 5] = [
            "clone".as_ref(),
            "--mirror".as_ref(),
            "--".as_ref(),
            url.as_ref(),
            dest.as_os_str(),
        ];
        self.run("clone", args, None, Some(transport), Some(Side::Source))
            .await?;
        Ok(())
    }

    async fn fetch_all_refs(
        &self,
        mirror: &Path,
        url: &str,
        transport: &TransportConfig,
    ) -> Result<(), SyncError> {
        reject_option_like("remote set-url", url)?;
        self.run(
            "remote set-url",
            ["remote", "set-url", "origin", url],
            Some(mirror),
            None,
            None,
        )
        .await?;
        self.run(
            "fetch",
            ["fetch", "--prune", "origin"],
            Some(mirror),
            Some(transport),
            Some(Side::Source),
        )
        .await?;
        Ok(())
    }

    async fn verify_mirror(&self, mirror: &Path) -> Result<bool, SyncError> {
        if !mirror.is_dir() {
            return Ok(false);
        }
        let output = self
            .exec(
                "rev-parse",
                ["rev-parse", "--is-bare-repository"],
                Some(mirror),
                None,
            )
            .await?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn list_refs(&self, mirror: &Path) -> Result<Vec<RefEntry>, SyncError> {
        let stdout = self
            .run(
                "for-each-ref",
                [
                    "for-each-ref",
                    "--format=%(objectname) %(refname)",
                    "refs/heads",
                    "refs/tags",
                ],
                Some(mirror),
                None,
                None,
            )
            .await?;
        Ok(parse_ref_lines(&stdout))
    }

    async fn is_ancestor(
        &self,
        mirror: &Path,
        ancestor: &CommitId,
        descendant: &CommitId,
    ) -> Result<bool, SyncError> {
        let probe = format!("{}^{{commit}}", ancestor.as_str());
        let present = self
            .exec("cat-file", ["cat-file", "-e", probe.as_str()], Some(mirror), None)
            .await?;
        if !present.status.success() {
            return Ok(false);
        }

        let output = self
            .exec(
                "merge-base",
                [
                    "merge-base",
                    "--is-ancestor",
                    ancestor.as_str(),
                    descendant.as_str(),
                ],
                Some(mirror),
                None,
            )
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(classify_failure(
                "merge-base",
                None,
                code.unwrap_or(-1),
                &String::from_utf8_lossy(&output.stderr),
            )),
        }
    }

    async fn remote_ref(
        &self,
        url: &str,
        transport: &TransportConfig,
        full_ref: &str,
    ) -> Result<Option<CommitId>, SyncError> {
        reject_option_like("ls-remote", url)?;
        let stdout = self
            .run(
                "ls-remote",
                ["ls-remote", url, full_ref],
                None,
                Some(transport),
                Some(Side::Target),
            )
            .await?;
        Ok(parse_ls_remote(&stdout, full_ref))
    }

    async fn push_ref(
        &self,
        mirror: &Path,
        url: &str,
        transport: &TransportConfig,
        full_ref: &str,
        commit: &CommitId,
    ) -> Result<(), SyncError> {
        reject_option_like("push", url)?;
        let refspec = format!("{}:{full_ref}", commit.as_str());
        self.run(
            "push",
            ["push", "--porcelain", url, refspec.as_str()],
            Some(mirror),
            Some(transport),
            Some(Side::Target),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Parse `for-each-ref --format='%(objectname) %(refname)'` output.
pub(crate) fn parse_ref_lines(stdout: &str) -> Vec<RefEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let (sha, refname) = line.trim().split_once(' ')?;
            let (kind, name) = split_ref(refname)?;
            Some(RefEntry {
                name: name.to_string(),
                kind,
                commit: CommitId::from(sha),
            })
        })
        .collect()
}

/// Pick the exact `full_ref` line out of `ls-remote` output.
///
/// Peeled `^{}` entries and partial matches are ignored.
pub(crate) fn parse_ls_remote(stdout: &str, full_ref: &str) -> Option<CommitId> {
    stdout.lines().find_map(|line| {
        let (sha, refname) = line.split_once('\t')?;
        (refname.trim() == full_ref).then(|| CommitId::from(sha.trim()))
    })
}

fn split_ref(refname: &str) -> Option<(RefKind, &str)> {
    [RefKind::Branch, RefKind::Tag]
        .into_iter()
        .find_map(|kind| refname.strip_prefix(kind.prefix()).map(|name| (kind, name)))
        .filter(|(_, name)| !name.is_empty())
}

fn classify_failure(operation: &'static str, side: Option<Side>, status: i32, stderr: &str) -> SyncError {
    let stderr = stderr.trim().to_string();
    match side {
        Some(side) if TRANSPORT_MARKERS.iter().any(|m| stderr.contains(m)) => {
            SyncError::Transport {
                side,
                detail: stderr,
            }
        }
        _ => SyncError::GitOperation {
            operation,
            status,
            stderr,
        },
    }
}

fn reject_option_like(operation: &'static str, url: &str) -> Result<(), SyncError> {
    if url.starts_with('-') {
        return Err(SyncError::GitOperation {
            operation,
            status: -1,
            stderr: format!("refusing option-like url '{url}'"),
        });
    }
    Ok(())
}
