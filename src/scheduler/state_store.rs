//! Persistent scheduler state.
//!
//! Two writers share the file: the scheduler tick and the session runner.
//! Every write is a read-merge-write of the JSON object under one
//! process-wide lock, so neither clobbers the other's fields, and lands via
//! temp file plus rename so readers never observe a torn file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::session::{SessionReport, MAX_REPORT_ERRORS};

static STATE_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// State persistence failures.
#[derive(Debug, Error)]
pub enum StateError {
    /// Filesystem failure.
    #[error("state file {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Encoding failure.
    #[error("state encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Everything persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerState {
    /// Successes counted toward today's limit.
    pub applications_today: u32,
    /// Day `applications_today` belongs to.
    pub last_run_date: Option<NaiveDate>,
    /// Start of the most recent session.
    pub last_run_time: Option<NaiveDateTime>,
    /// Next planned trigger.
    pub next_scheduled_run: Option<NaiveDateTime>,
    /// Successes across all sessions.
    pub total_applications: u64,
    /// Sessions recorded.
    pub session_count: u64,
    /// Last session's successes.
    pub last_successful: u32,
    /// Last session's failures.
    pub last_failed: u32,
    /// Last session's skips.
    pub last_skipped: u32,
    /// Last session's exit reason.
    pub last_exit_reason: Option<String>,
    /// Last session's errors, at most ten.
    pub last_errors: Vec<String>,
    /// Last session's id.
    pub last_session_id: Option<String>,
    /// Full last report.
    pub last_report: Option<SessionReport>,
}

/// File-backed store for [`SchedulerState`].
#[derive(Debug, Clone)]
pub struct SchedulerStateStore {
    path: PathBuf,
}

impl SchedulerStateStore {
    /// Store at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state; absent or unreadable files yield the defaults.
    #[must_use]
    pub fn load(&self) -> SchedulerState {
        let _guard = STATE_LOCK.lock();
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SchedulerState::default(),
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "cannot read scheduler state");
                return SchedulerState::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "corrupt scheduler state, using defaults");
                SchedulerState::default()
            }
        }
    }

    /// Persist the scheduler's tick fields, leaving report fields intact.
    ///
    /// # Errors
    ///
    /// The file cannot be written.
    pub fn save_tick(
        &self,
        applications_today: u32,
        last_run_date: Option<NaiveDate>,
        next_scheduled_run: Option<NaiveDateTime>,
    ) -> Result<(), StateError> {
        self.update(|obj| {
            obj.insert("applications_today".into(), applications_today.into());
            obj.insert("last_run_date".into(), serde_json::to_value(last_run_date)?);
            obj.insert("next_scheduled_run".into(), serde_json::to_value(next_scheduled_run)?);
            Ok(())
        })
    }

    /// Persist a session report, leaving tick fields intact and bumping the
    /// lifetime totals.
    ///
    /// # Errors
    ///
    /// The file cannot be written.
    pub fn save_session_report(&self, report: &SessionReport) -> Result<(), StateError> {
        self.update(|obj| {
            let count = |obj: &Map<String, Value>, key: &str| obj.get(key).and_then(Value::as_u64).unwrap_or(0);
            let session_count = count(obj, "session_count") + 1;
            let total = count(obj, "total_applications") + u64::from(report.successful);
            let errors: Vec<&String> = report.errors.iter().take(MAX_REPORT_ERRORS).collect();

            obj.insert("session_count".into(), session_count.into());
            obj.insert("total_applications".into(), total.into());
            obj.insert("last_run_time".into(), serde_json::to_value(report.start_time)?);
            obj.insert("last_successful".into(), report.successful.into());
            obj.insert("last_failed".into(), report.failed.into());
            obj.insert("last_skipped".into(), report.skipped.into());
            obj.insert("last_exit_reason".into(), report.exit_reason.clone().into());
            obj.insert("last_errors".into(), serde_json::to_value(errors)?);
            obj.insert("last_session_id".into(), report.session_id.clone().into());
            obj.insert("last_report".into(), serde_json::to_value(report)?);
            Ok(())
        })
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut Map<String, Value>) -> Result<(), serde_json::Error>,
    ) -> Result<(), StateError> {
        let _guard = STATE_LOCK.lock();
        let mut obj = self.read_object();
        apply(&mut obj)?;
        let rendered = serde_json::to_string_pretty(&Value::Object(obj))?;
        write_atomic(&self.path, &rendered)
    }

    fn read_object(&self) -> Map<String, Value> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return Map::new();
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(obj)) => obj,
            Ok(_) | Err(_) => {
                tracing::warn!(path = %self.path.display(), "discarding unreadable scheduler state");
                Map::new()
            }
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), StateError> {
    write_atomic_with(path, contents, |from, to| fs::rename(from, to))
}

fn write_atomic_with(
    path: &Path,
    contents: &str,
    rename: impl FnOnce(&Path, &Path) -> io::Result<()>,
) -> Result<(), StateError> {
    let io_err = |path: &Path, source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let file_name = path.file_name().map_or_else(|| "state".into(), |n| n.to_string_lossy().into_owned());
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let mut file = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
    file.write_all(contents.as_bytes()).map_err(|e| io_err(&tmp_path, e))?;
    file.sync_all().map_err(|e| io_err(&tmp_path, e))?;
    drop(file);

    if let Err(e) = rename(&tmp_path, path) {
        // Some filesystems refuse to replace an open file; fall back to copying.
        tracing::warn!(path = %path.display(), error = %e, "atomic rename failed, copying instead");
        let copied = fs::copy(&tmp_path, path).map_err(|e| io_err(path, e));
        let _ = fs::remove_file(&tmp_path);
        copied?;
    }
    Ok(())
}
