//! mirrorsync core library — domain types, configuration loading, errors.
//!
//! - [`types`] — jobs, credentials, ref decisions and sync results
//! - [`config`] — YAML configuration directory loading and merging
//! - [`error`] — [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{Settings, SshSettings, SyncSettings};
pub use error::ConfigError;
pub use types::{
    AutoSync, CommitId, Credential, CredentialName, Endpoint, HostPolicy, JobName, KeyType,
    RefDecision, RefKind, RefOutcome, RefPolicy, RepositoryJob, SyncBatchSummary, SyncResult,
};
