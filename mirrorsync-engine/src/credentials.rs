//! Credential resolution and per-invocation SSH transport binding.
//!
//! A [`TransportConfig`] is a set of environment overrides applied to exactly
//! one git subprocess. Nothing here touches process-wide state: no ssh-agent,
//! no `~/.ssh/config` edits, no `std::env::set_var`.
//!
//! ## Key directory layout
//!
//! ```text
//! <key_storage>/
//!   keys_manifest.yaml   (optional metadata: type, host_policy, bound_to)
//!   <name>               (private key)
//!   <name>.pub           (public key, unused by the engine)
//! ```

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use mirrorsync_core::{Credential, CredentialName, HostPolicy, KeyType};

use crate::error::SyncError;

pub const MANIFEST_FILE: &str = "keys_manifest.yaml";

// ---------------------------------------------------------------------------
// Credential store
// ---------------------------------------------------------------------------

/// Read-only lookup of SSH credentials by name.
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, name: &CredentialName) -> Result<Credential, SyncError>;
}

impl CredentialStore for HashMap<CredentialName, Credential> {
    fn resolve(&self, name: &CredentialName) -> Result<Credential, SyncError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| SyncError::CredentialNotFound {
                name: name.clone(),
                detail: "not registered".to_string(),
            })
    }
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    keys: HashMap<String, ManifestEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "type")]
    key_type: Option<KeyType>,
    host_policy: Option<HostPolicy>,
}

/// Credential store backed by a key directory.
///
/// The private key file must exist; manifest metadata is optional and falls
/// back to the configured default key type and strict host checking.
#[derive(Debug, Clone)]
pub struct KeyDirStore {
    storage: PathBuf,
    default_key_type: KeyType,
}

impl KeyDirStore {
    pub fn new(storage: impl Into<PathBuf>, default_key_type: KeyType) -> Self {
        Self {
            storage: storage.into(),
            default_key_type,
        }
    }

    fn manifest_entry(&self, name: &str) -> ManifestEntry {
        let path = self.storage.join(MANIFEST_FILE);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return ManifestEntry::default();
        };
        match serde_yaml::from_str::<Manifest>(&contents) {
            Ok(mut manifest) => manifest.keys.remove(name).unwrap_or_default(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable key manifest");
                ManifestEntry::default()
            }
        }
    }
}

impl CredentialStore for KeyDirStore {
    fn resolve(&self, name: &CredentialName) -> Result<Credential, SyncError> {
        if !is_plain_file_name(&name.0) {
            return Err(SyncError::CredentialNotFound {
                name: name.clone(),
                detail: "invalid key name".to_string(),
            });
        }
        let key_path = self.storage.join(&name.0);
        if !key_path.is_file() {
            return Err(SyncError::CredentialNotFound {
                name: name.clone(),
                detail: format!("no private key in {}", self.storage.display()),
            });
        }
        let entry = self.manifest_entry(&name.0);
        Ok(Credential {
            name: name.clone(),
            key_type: entry.key_type.unwrap_or(self.default_key_type),
            key_path,
            host_policy: entry.host_policy.unwrap_or_default(),
        })
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && Path::new(name).file_name() == Some(OsStr::new(name))
}

// ---------------------------------------------------------------------------
// Transport config
// ---------------------------------------------------------------------------

/// Environment overrides that pin one git invocation to one key.
#[derive(Clone)]
pub struct TransportConfig {
    credential: CredentialName,
    host_policy: HostPolicy,
    envs: Vec<(String, OsString)>,
    removed: Vec<&'static str>,
}

impl TransportConfig {
    pub fn for_credential(credential: &Credential) -> Self {
        let ssh = format!(
            "ssh -i {} -o IdentitiesOnly=yes -o IdentityAgent=none -o BatchMode=yes -o StrictHostKeyChecking={}",
            shell_quote(&credential.key_path.to_string_lossy()),
            credential.host_policy.ssh_option(),
        );
        Self {
            credential: credential.name.clone(),
            host_policy: credential.host_policy,
            envs: vec![
                ("GIT_SSH_COMMAND".to_string(), OsString::from(ssh)),
                ("GIT_TERMINAL_PROMPT".to_string(), OsString::from("0")),
            ],
            removed: vec!["SSH_AUTH_SOCK", "GIT_SSH"],
        }
    }

    /// Add an extra variable, e.g. the per-run `TMPDIR`.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn credential(&self) -> &CredentialName {
        &self.credential
    }

    pub fn host_policy(&self) -> HostPolicy {
        self.host_policy
    }

    pub fn env(&self, key: &str) -> Option<&OsStr> {
        self.envs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    /// Apply the overrides to a command about to be spawned.
    pub fn apply(&self, cmd: &mut tokio::process::Command) {
        for key in &self.removed {
            cmd.env_remove(key);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
    }
}

// The key path is left out on purpose of every log line.
impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("credential", &self.credential.0)
            .field("host_policy", &self.host_policy)
            .finish_non_exhaustive()
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Binder
// ---------------------------------------------------------------------------

/// Resolves credential names into independent [`TransportConfig`]s.
#[derive(Clone)]
pub struct CredentialBinder {
    store: Arc<dyn CredentialStore>,
}

impl CredentialBinder {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn bind(&self, name: &CredentialName) -> Result<TransportConfig, SyncError> {
        let credential = self.store.resolve(name)?;
        Ok(TransportConfig::for_credential(&credential))
    }
}
