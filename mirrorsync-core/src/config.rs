//! YAML configuration directory.
//!
//! # Layout
//!
//! ```text
//! <project>/
//!   configs/
//!     01-global.yaml        (version, ssh, sync sections)
//!     10-github-mirrors.yaml (repositories)
//!     ...
//! ```
//!
//! Files are read in lexical order. The `version`, `ssh` and `sync` sections
//! come from the first file that defines them; `repositories` are merged by
//! name, later files overriding earlier ones. Relative paths inside the
//! settings resolve against `<project>/`, the directory holding `configs/`.
//!
//! # API pattern
//!
//! Loaders take an explicit path (`load_at`); [`discover_from`] takes an
//! explicit start directory so tests never depend on the process cwd.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::types::{JobName, KeyType, RepositoryJob};

/// Directory name searched for when no explicit path is given.
pub const DEFAULT_CONFIG_DIR: &str = "configs";

/// Environment variable overriding discovery.
pub const CONFIG_ENV: &str = "MIRRORSYNC_CONFIG";

/// How many parent directories discovery climbs above the start directory.
const DISCOVERY_DEPTH: usize = 4;

// ---------------------------------------------------------------------------
// 1. Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Directory holding private keys and `keys_manifest.yaml`.
    pub key_storage: PathBuf,
    pub default_key_type: KeyType,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            key_storage: PathBuf::from(".ssh"),
            default_key_type: KeyType::Ed25519,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Root for per-run scratch directories.
    pub temp_dir: PathBuf,
    /// Timeout, in seconds, applied to every git operation.
    pub timeout: u64,
    /// Remove a run's scratch directory once the run finishes.
    pub cleanup_after_sync: bool,
    /// Root holding one bare mirror per job.
    pub mirror_cache_dir: PathBuf,
    /// Upper bound on jobs syncing at the same time.
    pub max_parallel_jobs: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("/tmp/git-sync"),
            timeout: 300,
            cleanup_after_sync: true,
            mirror_cache_dir: PathBuf::from(".mirror-cache"),
            max_parallel_jobs: 4,
        }
    }
}

impl SyncSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Fully merged and validated configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: String,
    pub ssh: SshSettings,
    pub sync: SyncSettings,
    pub repositories: Vec<RepositoryJob>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            ssh: SshSettings::default(),
            sync: SyncSettings::default(),
            repositories: Vec::new(),
        }
    }
}

impl Settings {
    pub fn job(&self, name: &JobName) -> Option<&RepositoryJob> {
        self.repositories.iter().find(|job| &job.name == name)
    }

    pub fn enabled_jobs(&self) -> impl Iterator<Item = &RepositoryJob> {
        self.repositories.iter().filter(|job| job.enabled)
    }
}

/// One YAML file as written by the user; every section is optional.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    version: Option<String>,
    ssh: Option<SshSettings>,
    sync: Option<SyncSettings>,
    #[serde(default)]
    repositories: Vec<RepositoryJob>,
}

// ---------------------------------------------------------------------------
// 2. Discovery
// ---------------------------------------------------------------------------

/// Locate the configuration path.
///
/// Order: `explicit` (must exist), then `env_value` (the caller passes
/// `$MIRRORSYNC_CONFIG`), then a `configs/` directory in `start` or one of its
/// parents.
pub fn discover_from(
    start: &Path,
    explicit: Option<&Path>,
    env_value: Option<&Path>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit.or(env_value) {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::NotFound(format!(
            "{} does not exist",
            path.display()
        )));
    }

    let mut current = Some(start);
    for _ in 0..=DISCOVERY_DEPTH {
        let Some(dir) = current else { break };
        let candidate = dir.join(DEFAULT_CONFIG_DIR);
        if candidate.is_dir() {
            return Ok(candidate);
        }
        current = dir.parent();
    }

    Err(ConfigError::NotFound(format!(
        "no {DEFAULT_CONFIG_DIR}/ directory in {} or its parents; pass --config or set {CONFIG_ENV}",
        start.display()
    )))
}

/// `discover_from` using the process working directory and environment.
pub fn discover(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let cwd = std::env::current_dir().map_err(|e| io_err(".", e))?;
    let env_value = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    discover_from(&cwd, explicit, env_value.as_deref())
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load a configuration directory or a single YAML file.
pub fn load_at(path: &Path) -> Result<Settings, ConfigError> {
    let (files, base) = if path.is_dir() {
        (read_dir_files(path)?, parent_or_self(path))
    } else {
        let file = read_file(path)?;
        let dir = parent_or_self(path);
        (vec![(path.to_path_buf(), file)], dir)
    };

    if files.is_empty() {
        return Err(ConfigError::NotFound(format!(
            "no .yaml files in {}",
            path.display()
        )));
    }

    let mut settings = merge(files);
    resolve_paths(&mut settings, &base);
    validate(&settings)?;
    Ok(settings)
}

/// `<home>/.mirrorsync/` — daemon socket, logs and sync history.
pub fn state_dir_at(home: &Path) -> PathBuf {
    home.join(".mirrorsync")
}

/// `state_dir_at` convenience wrapper.
pub fn state_dir() -> Result<PathBuf, ConfigError> {
    Ok(state_dir_at(&home()?))
}

fn read_dir_files(dir: &Path) -> Result<Vec<(PathBuf, ConfigFile)>, ConfigError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| io_err(dir, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|p| read_file(&p).map(|file| (p, file)))
        .collect()
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if contents.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn merge(files: Vec<(PathBuf, ConfigFile)>) -> Settings {
    let mut version = None;
    let mut ssh = None;
    let mut sync = None;
    let mut order: Vec<JobName> = Vec::new();
    let mut jobs: BTreeMap<JobName, RepositoryJob> = BTreeMap::new();

    for (_path, file) in files {
        version = version.or(file.version);
        ssh = ssh.or(file.ssh);
        sync = sync.or(file.sync);
        for job in file.repositories {
            if !jobs.contains_key(&job.name) {
                order.push(job.name.clone());
            }
            jobs.insert(job.name.clone(), job);
        }
    }

    Settings {
        version: version.unwrap_or_else(|| "1.0".to_string()),
        ssh: ssh.unwrap_or_default(),
        sync: sync.unwrap_or_default(),
        repositories: order
            .into_iter()
            .filter_map(|name| jobs.remove(&name))
            .collect(),
    }
}

fn resolve_paths(settings: &mut Settings, base: &Path) {
    for path in [
        &mut settings.ssh.key_storage,
        &mut settings.sync.mirror_cache_dir,
        &mut settings.sync.temp_dir,
    ] {
        if path.is_relative() {
            *path = base.join(&*path);
        }
    }
}

/// Check invariants the engine relies on.
pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if settings.sync.timeout == 0 {
        return Err(ConfigError::Invalid("sync.timeout must be positive".into()));
    }
    if settings.sync.max_parallel_jobs == 0 {
        return Err(ConfigError::Invalid(
            "sync.max_parallel_jobs must be positive".into(),
        ));
    }

    let mut seen = HashSet::new();
    for job in &settings.repositories {
        if !job.name.is_valid() {
            return Err(ConfigError::Invalid(format!(
                "repository name '{}' may only contain letters, digits, '.', '_' and '-'",
                job.name
            )));
        }
        if !seen.insert(&job.name) {
            return Err(ConfigError::Invalid(format!(
                "duplicate repository name '{}'",
                job.name
            )));
        }
        for (side, endpoint) in [("source", &job.source), ("target", &job.target)] {
            if endpoint.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "repository '{}': {side}.url is empty",
                    job.name
                )));
            }
            if endpoint.ssh_key.0.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "repository '{}': {side}.ssh_key is empty",
                    job.name
                )));
            }
        }
        if job.auto_sync_enabled && job.auto_sync_interval == 0 {
            return Err(ConfigError::Invalid(format!(
                "repository '{}': auto_sync_interval must be positive",
                job.name
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn parent_or_self(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ALPHA: &str = r#"
repositories:
  - name: alpha
    source: { url: "git@github.com:acme/alpha.git", ssh_key: gh }
    target: { url: "git@gitlab.com:acme/alpha.git", ssh_key: gl }
"#;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.sync.timeout, 300);
        assert!(s.sync.cleanup_after_sync);
        assert_eq!(s.sync.max_parallel_jobs, 4);
        assert_eq!(s.ssh.key_storage, PathBuf::from(".ssh"));
    }

    #[test]
    fn single_file_resolves_relative_paths_against_its_directory() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("mirror.yaml");
        std::fs::write(&file, ALPHA).unwrap();

        let settings = load_at(&file).expect("load");
        assert_eq!(settings.repositories.len(), 1);
        assert_eq!(settings.ssh.key_storage, tmp.path().join(".ssh"));
        assert_eq!(
            settings.sync.mirror_cache_dir,
            tmp.path().join(".mirror-cache")
        );
        assert_eq!(settings.sync.temp_dir, PathBuf::from("/tmp/git-sync"));
    }

    #[test]
    fn discover_finds_configs_in_parent() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("configs")).unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = discover_from(&nested, None, None).expect("discover");
        assert_eq!(found, tmp.path().join("configs"));
    }

    #[test]
    fn discover_explicit_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        let err = discover_from(tmp.path(), Some(&missing), None).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)), "got: {err}");
    }

    #[test]
    fn discover_prefers_explicit_over_env() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.yaml");
        let b = tmp.path().join("b.yaml");
        std::fs::write(&a, "").unwrap();
        std::fs::write(&b, "").unwrap();
        let found = discover_from(tmp.path(), Some(&a), Some(&b)).unwrap();
        assert_eq!(found, a);
        let found = discover_from(tmp.path(), None, Some(&b)).unwrap();
        assert_eq!(found, b);
    }

    #[test]
    fn state_dir_is_under_home() {
        let tmp = TempDir::new().unwrap();
        assert!(state_dir_at(tmp.path()).ends_with(".mirrorsync"));
    }
}
