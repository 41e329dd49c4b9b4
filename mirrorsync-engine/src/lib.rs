//! # mirrorsync-engine
//!
//! Mirror-cache-backed sync of git branches and tags between remotes.
//!
//! [`Scheduler`] runs jobs concurrently and on recurring triggers;
//! [`Orchestrator::run`] performs one job's fetch, guard and push cycle.
//! Nothing here ever force-pushes.

pub mod credentials;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod history;
pub mod mirror;
pub mod orchestrator;
pub mod scheduler;

pub use credentials::{CredentialBinder, CredentialStore, KeyDirStore, TransportConfig};
pub use error::{SchedulerError, Side, SyncError};
pub use gateway::{GitCli, RefEntry, RepositoryGateway};
pub use guard::Verdict;
pub use mirror::{MirrorGuard, MirrorHandle, MirrorStore};
pub use orchestrator::{Orchestrator, RunOptions};
pub use scheduler::{JobState, JobStatus, ReloadReport, RunOutcome, Scheduler};
