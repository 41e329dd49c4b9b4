//! Configuration directory loading, merging and validation.

use assert_fs::prelude::*;
use mirrorsync_core::{
    config::{self, DEFAULT_CONFIG_DIR},
    ConfigError, HostPolicy, JobName,
};
use predicates::prelude::*;
use rstest::rstest;

const GLOBAL: &str = r#"
version: "1.0"
ssh:
  key_storage: keys
  default_key_type: rsa
sync:
  temp_dir: /var/tmp/mirrorsync
  timeout: 120
  cleanup_after_sync: false
  mirror_cache_dir: cache
  max_parallel_jobs: 2
"#;

const GITHUB: &str = r#"
repositories:
  - name: alpha
    source: { url: "git@github.com:acme/alpha.git", ssh_key: gh }
    target: { url: "git@gitlab.com:acme/alpha.git", ssh_key: gl }
    sync_branches: [main, dev]
    auto_sync_enabled: true
    auto_sync_interval: 600
  - name: beta
    source: { url: "git@github.com:acme/beta.git", ssh_key: gh }
    target: { url: "git@gitlab.com:acme/beta.git", ssh_key: gl }
    enabled: false
"#;

const OVERRIDE: &str = r#"
sync:
  timeout: 5
repositories:
  - name: alpha
    source: { url: "git@github.com:acme/alpha-renamed.git", ssh_key: gh }
    target: { url: "git@gitlab.com:acme/alpha.git", ssh_key: gl }
    sync_tags: false
"#;

fn project() -> (assert_fs::TempDir, std::path::PathBuf) {
    let root = assert_fs::TempDir::new().expect("tempdir");
    let dir = root.child(DEFAULT_CONFIG_DIR);
    dir.create_dir_all().expect("mkdir configs");
    let path = dir.path().to_path_buf();
    (root, path)
}

#[test]
fn globals_come_from_first_file_and_repositories_merge_by_name() {
    let (root, dir) = project();
    root.child("configs/01-global.yaml").write_str(GLOBAL).unwrap();
    root.child("configs/10-github.yaml").write_str(GITHUB).unwrap();
    root.child("configs/20-override.yml").write_str(OVERRIDE).unwrap();

    let settings = config::load_at(&dir).expect("load");

    assert_eq!(settings.sync.timeout, 120, "first sync section wins");
    assert!(!settings.sync.cleanup_after_sync);
    assert_eq!(settings.sync.max_parallel_jobs, 2);
    assert_eq!(settings.ssh.key_storage, root.path().join("keys"));
    assert_eq!(settings.sync.mirror_cache_dir, root.path().join("cache"));

    let names: Vec<_> = settings.repositories.iter().map(|j| j.name.0.as_str()).collect();
    assert_eq!(names, ["alpha", "beta"], "first-seen order is kept");

    let alpha = settings.job(&JobName::from("alpha")).expect("alpha");
    assert_eq!(alpha.source.url, "git@github.com:acme/alpha-renamed.git");
    assert!(!alpha.sync_tags);
    assert!(alpha.sync_branches.is_empty(), "later definition replaces whole job");

    let enabled: Vec<_> = settings.enabled_jobs().map(|j| j.name.0.clone()).collect();
    assert_eq!(enabled, ["alpha"]);
}

#[test]
fn empty_directory_is_not_found() {
    let (_root, dir) = project();
    let err = config::load_at(&dir).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound(_)), "got: {err}");
}

#[test]
fn non_yaml_files_are_ignored() {
    let (root, dir) = project();
    root.child("configs/README.md").write_str("not: [yaml").unwrap();
    root.child("configs/10-github.yaml").write_str(GITHUB).unwrap();
    let settings = config::load_at(&dir).expect("load");
    assert_eq!(settings.repositories.len(), 2);
}

#[test]
fn corrupt_yaml_reports_file_path() {
    let (root, dir) = project();
    root.child("configs/bad.yaml")
        .write_str("repositories: [ {name: : broken")
        .unwrap();
    let err = config::load_at(&dir).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(predicate::str::contains("bad.yaml").eval(&err.to_string()));
}

#[rstest]
#[case::path_traversal("../evil")]
#[case::slash("a/b")]
#[case::hidden(".git")]
#[case::empty("")]
fn unsafe_job_names_are_rejected(#[case] name: &str) {
    let (root, dir) = project();
    let yaml = format!(
        r#"
repositories:
  - name: "{name}"
    source: {{ url: "git@github.com:a/b.git", ssh_key: gh }}
    target: {{ url: "git@gitlab.com:a/b.git", ssh_key: gl }}
"#
    );
    root.child("configs/jobs.yaml").write_str(&yaml).unwrap();
    let err = config::load_at(&dir).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
}

#[test]
fn empty_url_is_rejected() {
    let (root, dir) = project();
    root.child("configs/jobs.yaml")
        .write_str(
            r#"
repositories:
  - name: alpha
    source: { url: "", ssh_key: gh }
    target: { url: "git@gitlab.com:a/b.git", ssh_key: gl }
"#,
        )
        .unwrap();
    let err = config::load_at(&dir).unwrap_err();
    assert!(err.to_string().contains("source.url"), "got: {err}");
}

#[test]
fn zero_timeout_is_rejected() {
    let (root, dir) = project();
    root.child("configs/01.yaml")
        .write_str("sync:\n  timeout: 0\n")
        .unwrap();
    root.child("configs/02.yaml").write_str(GITHUB).unwrap();
    let err = config::load_at(&dir).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
}

#[test]
fn host_policy_parses_from_yaml() {
    let policy: HostPolicy = serde_yaml::from_str("strict").unwrap();
    assert_eq!(policy, HostPolicy::Strict);
}
