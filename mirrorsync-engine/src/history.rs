//! Sync history: a capped JSON log of finished runs.
//!
//! Persists a JSON array at `<state>/history/sync_history.json`, newest
//! record first, at most [`MAX_RECORDS`] entries. Writes use the atomic
//! `.tmp` + rename pattern.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mirrorsync_core::{JobName, RefOutcome, SyncResult};

use crate::error::{io_err, SyncError};

pub const MAX_RECORDS: usize = 1000;

/// One finished sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub job: JobName,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub pushed: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryRecord {
    pub fn from_result(result: &SyncResult) -> Self {
        let names = |pred: fn(RefOutcome) -> bool| {
            result
                .decisions
                .iter()
                .filter(|d| pred(d.outcome))
                .map(|d| d.name.clone())
                .collect::<Vec<_>>()
        };
        Self {
            id: format!("{}-{}", result.started_at.timestamp_millis(), result.job),
            job: result.job.clone(),
            timestamp: result.started_at,
            success: result.success,
            dry_run: result.dry_run,
            pushed: names(|o| o == RefOutcome::Pushed),
            skipped: names(RefOutcome::is_skipped),
            failed: names(|o| o == RefOutcome::Failed),
            duration_ms: u64::try_from(result.duration_ms).unwrap_or(u64::MAX),
            error: result.error.clone(),
        }
    }
}

/// Per-job aggregate in [`HistoryStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage of successful runs, 0 when there is no history.
    pub success_rate: f64,
    pub jobs: BTreeMap<JobName, JobStats>,
}

/// `<state>/history/sync_history.json`
pub fn history_path_at(state: &Path) -> PathBuf {
    state.join("history").join("sync_history.json")
}

/// All records, newest first. Empty when the file does not exist yet.
pub fn load_at(state: &Path) -> Result<Vec<HistoryRecord>, SyncError> {
    let path = history_path_at(state);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&contents)?)
}

fn save_at(state: &Path, records: &[HistoryRecord]) -> Result<(), SyncError> {
    let path = history_path_at(state);
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid history path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(records)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// Prepend `record`, dropping the oldest entries beyond [`MAX_RECORDS`].
pub fn append_at(state: &Path, record: HistoryRecord) -> Result<(), SyncError> {
    let mut records = load_at(state)?;
    records.insert(0, record);
    records.truncate(MAX_RECORDS);
    save_at(state, &records)
}

/// Page through records, optionally for one job only.
pub fn records_at(
    state: &Path,
    job: Option<&JobName>,
    limit: usize,
    offset: usize,
) -> Result<Vec<HistoryRecord>, SyncError> {
    Ok(load_at(state)?
        .into_iter()
        .filter(|r| job.map_or(true, |j| &r.job == j))
        .skip(offset)
        .take(limit)
        .collect())
}

pub fn record_at(state: &Path, id: &str) -> Result<Option<HistoryRecord>, SyncError> {
    Ok(load_at(state)?.into_iter().find(|r| r.id == id))
}

/// Remove one record; `false` when no record has that id.
pub fn delete_at(state: &Path, id: &str) -> Result<bool, SyncError> {
    let mut records = load_at(state)?;
    let before = records.len();
    records.retain(|r| r.id != id);
    if records.len() == before {
        return Ok(false);
    }
    save_at(state, &records)?;
    Ok(true)
}

/// Remove every record, or only those of `job`. Returns how many went.
pub fn clear_at(state: &Path, job: Option<&JobName>) -> Result<usize, SyncError> {
    let mut records = load_at(state)?;
    let before = records.len();
    match job {
        Some(job) => records.retain(|r| &r.job != job),
        None => records.clear(),
    }
    save_at(state, &records)?;
    Ok(before - records.len())
}

pub fn stats_at(state: &Path) -> Result<HistoryStats, SyncError> {
    let records = load_at(state)?;
    let mut stats = HistoryStats {
        total: records.len(),
        ..HistoryStats::default()
    };
    for record in &records {
        let job = stats.jobs.entry(record.job.clone()).or_default();
        job.total += 1;
        if record.success {
            stats.successful += 1;
            job.successful += 1;
        } else {
            stats.failed += 1;
            job.failed += 1;
        }
        // Newest first, so the first record seen per job is its latest run.
        job.last_run_at.get_or_insert(record.timestamp);
    }
    if stats.total > 0 {
        stats.success_rate = stats.successful as f64 * 100.0 / stats.total as f64;
    }
    Ok(stats)
}
