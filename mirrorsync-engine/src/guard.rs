//! Fast-forward guard: decides, per ref, whether a push is safe.
//!
//! The decision itself does no I/O. Ancestry is answered by the caller through
//! an async function so the same rules apply to real git and to test fakes.

use std::future::Future;

use mirrorsync_core::{CommitId, RefOutcome};

/// Reason recorded for a configured branch that the source does not have.
pub const NOT_FOUND: &str = "not-found";

/// Outcome of [`decide`] for one ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Target does not have the ref yet.
    NewRef,
    /// Target's commit is an ancestor of the source's.
    FastForward,
    /// Target already points at the source commit.
    UpToDate,
    /// Target has history the source lacks; never overwritten.
    Diverged,
}

impl Verdict {
    pub fn should_push(self) -> bool {
        matches!(self, Verdict::NewRef | Verdict::FastForward)
    }

    pub fn outcome(self) -> RefOutcome {
        match self {
            Verdict::NewRef | Verdict::FastForward => RefOutcome::Pushed,
            Verdict::UpToDate => RefOutcome::SkippedUpToDate,
            Verdict::Diverged => RefOutcome::SkippedDiverged,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Verdict::NewRef => "new ref",
            Verdict::FastForward => "fast-forward",
            Verdict::UpToDate => "up-to-date",
            Verdict::Diverged => "diverged",
        }
    }
}

/// Decide whether `source` may be pushed over `target`.
///
/// `is_ancestor(target, source)` is consulted only when both sides exist and
/// differ.
pub async fn decide<F, Fut, E>(
    source: &CommitId,
    target: Option<&CommitId>,
    is_ancestor: F,
) -> Result<Verdict, E>
where
    F: FnOnce(CommitId, CommitId) -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let Some(target) = target else {
        return Ok(Verdict::NewRef);
    };
    if target == source {
        return Ok(Verdict::UpToDate);
    }
    if is_ancestor(target.clone(), source.clone()).await? {
        Ok(Verdict::FastForward)
    } else {
        Ok(Verdict::Diverged)
    }
}
