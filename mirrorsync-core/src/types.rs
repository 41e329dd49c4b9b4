//! Domain types for the mirrorsync engine.
//!
//! Jobs and credentials are read from configuration; decisions and results are
//! produced fresh by every sync attempt. All types serialize via serde so the
//! daemon and CLI can hand them out as JSON unchanged.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Unique name of a repository job. Also names the job's mirror directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobName(pub String);

impl JobName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the name is safe to use as a single path component.
    ///
    /// Allowed: ASCII alphanumerics, `.`, `_`, `-`; must not start with `.`.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && !self.0.starts_with('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for JobName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Name of an SSH credential held by the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialName(pub String);

impl fmt::Display for CredentialName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CredentialName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CredentialName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A git object id (full hex SHA as reported by git).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub String);

impl CommitId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CommitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// One side of a mirror relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    pub ssh_key: CredentialName,
}

/// Which refs a job mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefPolicy<'a> {
    /// Explicit branch names; empty means every branch.
    pub branches: &'a [String],
    pub tags: bool,
}

/// Recurring trigger settings for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSync {
    pub enabled: bool,
    pub interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    3600
}

/// A source → target mirroring job, as supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryJob {
    pub name: JobName,
    pub source: Endpoint,
    pub target: Endpoint,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sync_branches: Vec<String>,
    #[serde(default = "default_true")]
    pub sync_tags: bool,
    #[serde(default)]
    pub auto_sync_enabled: bool,
    /// Seconds between recurring syncs.
    #[serde(default = "default_interval")]
    pub auto_sync_interval: u64,
}

impl RepositoryJob {
    pub fn ref_policy(&self) -> RefPolicy<'_> {
        RefPolicy {
            branches: &self.sync_branches,
            tags: self.sync_tags,
        }
    }

    /// Auto-sync only applies to enabled jobs.
    pub fn auto_sync(&self) -> AutoSync {
        AutoSync {
            enabled: self.enabled && self.auto_sync_enabled,
            interval: Duration::from_secs(self.auto_sync_interval.max(1)),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Ed25519,
    Rsa,
    Ecdsa,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ed25519 => write!(f, "ed25519"),
            KeyType::Rsa => write!(f, "rsa"),
            KeyType::Ecdsa => write!(f, "ecdsa"),
        }
    }
}

/// Host key verification applied to SSH connections made with a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostPolicy {
    /// Unknown or changed host keys are rejected.
    #[default]
    Strict,
    /// Unknown hosts are recorded on first use; changed keys are still rejected.
    AcceptNew,
}

impl HostPolicy {
    /// Value for ssh's `StrictHostKeyChecking` option.
    pub fn ssh_option(self) -> &'static str {
        match self {
            HostPolicy::Strict => "yes",
            HostPolicy::AcceptNew => "accept-new",
        }
    }
}

/// A resolved SSH credential. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub name: CredentialName,
    pub key_type: KeyType,
    /// Location of the private key on disk.
    pub key_path: PathBuf,
    pub host_policy: HostPolicy,
}

// ---------------------------------------------------------------------------
// Sync results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Branch,
    Tag,
}

impl RefKind {
    /// Full ref namespace prefix, e.g. `refs/heads/`.
    pub fn prefix(self) -> &'static str {
        match self {
            RefKind::Branch => "refs/heads/",
            RefKind::Tag => "refs/tags/",
        }
    }

    pub fn full_name(self, short: &str) -> String {
        format!("{}{short}", self.prefix())
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKind::Branch => write!(f, "branch"),
            RefKind::Tag => write!(f, "tag"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefOutcome {
    Pushed,
    SkippedUpToDate,
    SkippedDiverged,
    SkippedFiltered,
    Failed,
}

impl RefOutcome {
    pub fn is_skipped(self) -> bool {
        matches!(
            self,
            RefOutcome::SkippedUpToDate | RefOutcome::SkippedDiverged | RefOutcome::SkippedFiltered
        )
    }
}

impl fmt::Display for RefOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefOutcome::Pushed => write!(f, "pushed"),
            RefOutcome::SkippedUpToDate => write!(f, "skipped (up-to-date)"),
            RefOutcome::SkippedDiverged => write!(f, "skipped (diverged)"),
            RefOutcome::SkippedFiltered => write!(f, "skipped (filtered)"),
            RefOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// What happened (or, in dry-run, would happen) to one ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefDecision {
    /// Short name, e.g. `main` or `v1.0`.
    pub name: String,
    pub kind: RefKind,
    pub outcome: RefOutcome,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_commit: Option<CommitId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_commit: Option<CommitId>,
}

/// Outcome of one orchestration run for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub job: JobName,
    pub success: bool,
    pub dry_run: bool,
    pub decisions: Vec<RefDecision>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    pub fn count(&self, outcome: RefOutcome) -> usize {
        self.decisions.iter().filter(|d| d.outcome == outcome).count()
    }

    pub fn decision(&self, name: &str) -> Option<&RefDecision> {
        self.decisions.iter().find(|d| d.name == name)
    }
}

/// Aggregate of a scheduler-triggered batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<SyncResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u128,
}

impl SyncBatchSummary {
    pub fn from_results(
        results: Vec<SyncResult>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let successful = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            results,
            started_at,
            finished_at,
            duration_ms: duration.as_millis(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> RepositoryJob {
        RepositoryJob {
            name: JobName::from(name),
            source: Endpoint {
                url: "git@github.com:acme/alpha.git".into(),
                ssh_key: CredentialName::from("gh"),
            },
            target: Endpoint {
                url: "git@gitlab.com:acme/alpha.git".into(),
                ssh_key: CredentialName::from("gl"),
            },
            enabled: true,
            sync_branches: vec![],
            sync_tags: true,
            auto_sync_enabled: true,
            auto_sync_interval: 60,
        }
    }

    #[test]
    fn newtype_display() {
        assert_eq!(JobName::from("alpha").to_string(), "alpha");
        assert_eq!(CredentialName::from("gh").to_string(), "gh");
        assert_eq!(CommitId::from("abc").to_string(), "abc");
    }

    #[test]
    fn job_name_validation() {
        assert!(JobName::from("alpha-1.mirror_x").is_valid());
        assert!(!JobName::from("").is_valid());
        assert!(!JobName::from(".hidden").is_valid());
        assert!(!JobName::from("../escape").is_valid());
        assert!(!JobName::from("a/b").is_valid());
    }

    #[test]
    fn commit_short_handles_short_ids() {
        assert_eq!(CommitId::from("0123456789abcdef").short(), "01234567");
        assert_eq!(CommitId::from("c1").short(), "c1");
    }

    #[test]
    fn auto_sync_requires_enabled_job() {
        let mut j = job("alpha");
        assert!(j.auto_sync().enabled);
        assert_eq!(j.auto_sync().interval, Duration::from_secs(60));
        j.enabled = false;
        assert!(!j.auto_sync().enabled);
    }

    #[test]
    fn job_yaml_defaults() {
        let yaml = r#"
name: alpha
source: { url: "git@github.com:acme/alpha.git", ssh_key: gh }
target: { url: "git@gitlab.com:acme/alpha.git", ssh_key: gl }
"#;
        let parsed: RepositoryJob = serde_yaml::from_str(yaml).expect("parse");
        assert!(parsed.enabled);
        assert!(parsed.sync_tags);
        assert!(parsed.sync_branches.is_empty());
        assert!(!parsed.auto_sync_enabled);
        assert_eq!(parsed.auto_sync_interval, 3600);
    }

    #[test]
    fn ref_kind_full_name() {
        assert_eq!(RefKind::Branch.full_name("main"), "refs/heads/main");
        assert_eq!(RefKind::Tag.full_name("v1"), "refs/tags/v1");
    }

    #[test]
    fn host_policy_ssh_option_and_serde() {
        assert_eq!(HostPolicy::Strict.ssh_option(), "yes");
        assert_eq!(HostPolicy::AcceptNew.ssh_option(), "accept-new");
        let parsed: HostPolicy = serde_yaml::from_str("accept-new").expect("parse");
        assert_eq!(parsed, HostPolicy::AcceptNew);
    }

    #[test]
    fn batch_summary_counts() {
        let now = Utc::now();
        let ok = SyncResult {
            job: JobName::from("a"),
            success: true,
            dry_run: false,
            decisions: vec![],
            started_at: now,
            duration_ms: 1,
            error: None,
        };
        let failed = SyncResult {
            job: JobName::from("b"),
            success: false,
            error: Some("boom".into()),
            ..ok.clone()
        };
        let summary =
            SyncBatchSummary::from_results(vec![ok, failed], now, now, Duration::from_millis(5));
        assert_eq!(summary.total, 2);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.duration_ms, 5);
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_yaml::to_string(&RefOutcome::SkippedDiverged).expect("serialize");
        assert_eq!(json.trim(), "skipped_diverged");
        assert!(RefOutcome::SkippedFiltered.is_skipped());
        assert!(!RefOutcome::Failed.is_skipped());
    }
}
