//! Error types for mirrorsync-engine.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use mirrorsync_core::{CredentialName, JobName};

/// Which remote an operation was talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Target => write!(f, "target"),
        }
    }
}

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The credential store has no key under this name.
    #[error("credential '{name}' not found: {detail}")]
    CredentialNotFound { name: CredentialName, detail: String },

    /// Cloning or refreshing the mirror failed; the existing mirror is kept.
    #[error("mirror sync failed for '{job}': {detail}")]
    MirrorSync { job: JobName, detail: String },

    /// The cached mirror is unreadable and must be rebuilt.
    #[error("mirror for '{job}' at {path} is corrupt: {detail}")]
    MirrorCorrupt {
        job: JobName,
        path: PathBuf,
        detail: String,
    },

    /// Network or authentication failure talking to a remote.
    #[error("{side} transport error: {detail}")]
    Transport { side: Side, detail: String },

    /// A git operation exceeded its timeout and was killed.
    #[error("git {operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// git exited unexpectedly; `stderr` holds its diagnostics.
    #[error("git {operation} failed (exit {status}): {stderr}")]
    GitOperation {
        operation: &'static str,
        status: i32,
        stderr: String,
    },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (history store).
    #[error("history JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the job registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("unknown job '{0}'")]
    UnknownJob(JobName),

    #[error("duplicate job name '{0}'")]
    DuplicateJob(JobName),

    #[error("invalid job name '{0}'")]
    InvalidJobName(JobName),

    /// The scheduler is shutting down and accepts no new runs.
    #[error("scheduler is stopping")]
    Stopped,
}

impl SyncError {
    /// Whether the next scheduled attempt may succeed without operator action.
    ///
    /// The engine never retries within a run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::MirrorSync { .. }
                | SyncError::MirrorCorrupt { .. }
                | SyncError::Transport { .. }
                | SyncError::Timeout { .. }
        )
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_counts_as_retryable() {
        let err = SyncError::Timeout {
            operation: "fetch",
            after: Duration::from_secs(30),
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "git fetch timed out after 30s");
    }

    #[test]
    fn git_operation_is_not_retryable() {
        let err = SyncError::GitOperation {
            operation: "for-each-ref",
            status: 128,
            stderr: "fatal: bad object".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("fatal: bad object"));
    }

    #[test]
    fn scheduler_errors_name_the_job() {
        let err = SchedulerError::UnknownJob(JobName::from("ghost"));
        assert_eq!(err.to_string(), "unknown job 'ghost'");
    }

    #[test]
    fn transport_error_names_side() {
        let err = SyncError::Transport {
            side: Side::Target,
            detail: "Permission denied (publickey)".into(),
        };
        assert!(err.to_string().starts_with("target transport error"));
    }
}
