use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

fn mirrorsync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("mirrorsync"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("MIRRORSYNC_CONFIG")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1")
        .current_dir(home);
    cmd
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(["-c", "user.name=Mirror Test", "-c", "user.email=mirror@test.invalid"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

/// A home directory with `configs/sync.yaml` and empty key files.
fn workspace(source: &str, target: &str, enabled: bool) -> TempDir {
    let home = TempDir::new().expect("home");
    let keys = home.path().join("keys");
    std::fs::create_dir_all(&keys).expect("keys dir");
    for key in ["gh", "gl"] {
        std::fs::write(keys.join(key), "").expect("key file");
    }
    let configs = home.path().join("configs");
    std::fs::create_dir_all(&configs).expect("configs dir");
    std::fs::write(
        configs.join("sync.yaml"),
        format!(
            r#"
ssh:
  key_storage: keys
sync:
  temp_dir: scratch
  mirror_cache_dir: cache
  timeout: 60
repositories:
  - name: alpha
    source: {{ url: "{source}", ssh_key: gh }}
    target: {{ url: "{target}", ssh_key: gl }}
    enabled: {enabled}
"#
        ),
    )
    .expect("config");
    home
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn unknown_job_fails_with_message() {
    let home = workspace("/nonexistent/a.git", "/nonexistent/b.git", true);
    mirrorsync_cmd(home.path())
        .args(["sync", "nope"])
        .assert()
        .failure()
        .stderr(contains("unknown job 'nope'"));
}

#[test]
fn missing_configuration_is_reported() {
    let home = TempDir::new().expect("home");
    mirrorsync_cmd(home.path())
        .args(["sync"])
        .assert()
        .failure()
        .stderr(contains("failed to locate configuration"));
}

#[test]
fn failed_sync_exits_non_zero_and_is_recorded() {
    let home = workspace("/nonexistent/a.git", "/nonexistent/b.git", true);

    let output = mirrorsync_cmd(home.path())
        .args(["sync", "alpha", "--json"])
        .output()
        .expect("run sync");
    assert_eq!(output.status.code(), Some(1));
    let result = stdout_json(&output);
    assert_eq!(result["kind"], "single");
    assert_eq!(result["job"], "alpha");
    assert_eq!(result["success"], false);
    assert!(result["error"].is_string());

    let output = mirrorsync_cmd(home.path())
        .args(["history", "--json"])
        .output()
        .expect("run history");
    assert!(output.status.success());
    let records = stdout_json(&output);
    let records = records.as_array().expect("records array");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["job"], "alpha");
    assert_eq!(records[0]["success"], false);
}

#[test]
fn history_pages_shows_and_deletes_single_runs() {
    let home = workspace("/nonexistent/a.git", "/nonexistent/b.git", true);
    for _ in 0..2 {
        mirrorsync_cmd(home.path())
            .args(["sync", "alpha"])
            .assert()
            .failure();
    }

    let output = mirrorsync_cmd(home.path())
        .args(["history", "--json"])
        .output()
        .expect("history");
    let all = stdout_json(&output);
    let all = all.as_array().expect("records array");
    assert_eq!(all.len(), 2);
    let oldest = all[1]["id"].as_str().expect("id").to_string();

    let output = mirrorsync_cmd(home.path())
        .args(["history", "--json", "--offset", "1"])
        .output()
        .expect("history offset");
    let paged = stdout_json(&output);
    assert_eq!(paged.as_array().expect("records array").len(), 1);
    assert_eq!(paged[0]["id"], oldest.as_str());

    let output = mirrorsync_cmd(home.path())
        .args(["history", "--json", "--show", &oldest])
        .output()
        .expect("history show");
    assert!(output.status.success());
    let record = stdout_json(&output);
    assert_eq!(record["job"], "alpha");
    assert!(record["error"].is_string());

    mirrorsync_cmd(home.path())
        .args(["history", "--delete", &oldest])
        .assert()
        .success()
        .stdout(contains("removed run"));
    mirrorsync_cmd(home.path())
        .args(["history", "--show", &oldest])
        .assert()
        .failure()
        .stderr(contains("no recorded run"));
}

#[test]
fn batch_skips_disabled_jobs() {
    let home = workspace("/nonexistent/a.git", "/nonexistent/b.git", false);
    mirrorsync_cmd(home.path())
        .args(["sync", "--dry-run"])
        .assert()
        .success()
        .stdout(contains("No enabled jobs configured."));
}

#[test]
fn explicit_config_flag_wins_over_discovery() {
    let home = workspace("/nonexistent/a.git", "/nonexistent/b.git", false);
    let elsewhere = TempDir::new().expect("cwd");
    let config: PathBuf = home.path().join("configs");
    mirrorsync_cmd(home.path())
        .current_dir(elsewhere.path())
        .args(["sync", "--dry-run", "--config"])
        .arg(&config)
        .assert()
        .success();
}

#[test]
fn status_without_daemon_says_so() {
    let home = TempDir::new().expect("home");
    mirrorsync_cmd(home.path())
        .args(["status"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));

    let output = mirrorsync_cmd(home.path())
        .args(["daemon", "status"])
        .output()
        .expect("daemon status");
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["running"], false);
}

#[test]
fn history_stats_on_empty_state() {
    let home = TempDir::new().expect("home");
    let output = mirrorsync_cmd(home.path())
        .args(["history", "--stats", "--json"])
        .output()
        .expect("history stats");
    assert!(output.status.success());
    let stats = stdout_json(&output);
    assert_eq!(stats["total"], 0);
    assert_eq!(stats["success_rate"], 0.0);
}

#[test]
fn sync_pushes_new_branch_then_reports_up_to_date() {
    if !git_available() {
        eprintln!("git not installed; skipping");
        return;
    }
    let repos = TempDir::new().expect("repos");
    let source = repos.path().join("source");
    let target = repos.path().join("target.git");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::create_dir_all(&target).unwrap();
    git(&source, &["init", "-q"]);
    git(&source, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(&source, &["commit", "-q", "--allow-empty", "-m", "first"]);
    git(&target, &["init", "-q", "--bare"]);

    let home = workspace(
        &source.to_string_lossy(),
        &target.to_string_lossy(),
        true,
    );

    mirrorsync_cmd(home.path())
        .args(["sync", "--dry-run", "alpha"])
        .assert()
        .success()
        .stdout(contains("[dry-run]"))
        .stdout(contains("would push: new ref"));

    mirrorsync_cmd(home.path())
        .args(["sync", "alpha"])
        .assert()
        .success()
        .stdout(contains("1 pushed"));

    mirrorsync_cmd(home.path())
        .args(["sync", "alpha"])
        .assert()
        .success()
        .stdout(contains("0 pushed, 1 up-to-date"));

    mirrorsync_cmd(home.path())
        .args(["history", "--job", "alpha"])
        .assert()
        .success()
        .stdout(contains("alpha"));
}
