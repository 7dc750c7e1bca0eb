//! Session outcome records.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Error messages kept per report.
pub const MAX_REPORT_ERRORS: usize = 10;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Successful applications met the target.
    TargetReached {
        /// Reconciled successes.
        successful: u32,
        /// Session target.
        target: u32,
    },
    /// The task finished below target.
    Completed {
        /// Reconciled successes.
        successful: u32,
        /// Session target.
        target: u32,
    },
    /// The task's external dependency disconnected.
    ConnectionLost,
    /// The watchdog or runtime deadline stopped the session.
    WatchdogAbort(String),
    /// The task returned an error or panicked.
    TaskFailed(String),
    /// Configuration could not be loaded.
    ConfigLoadFailed(String),
    /// The task could not be located or prepared.
    ImportFailed(String),
    /// The runner itself failed.
    Catastrophic(String),
    /// Interrupted by the operator.
    KeyboardInterrupt,
}

impl ExitReason {
    /// Whether this reason signals a failed session.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::TargetReached { .. } | Self::Completed { .. })
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetReached { successful, target } => {
                write!(f, "target_reached ({successful}/{target})")
            }
            Self::Completed { successful, target } => write!(f, "completed ({successful}/{target})"),
            Self::ConnectionLost => f.write_str("chrome_connection_lost"),
            Self::WatchdogAbort(reason) => write!(f, "watchdog_abort: {reason}"),
            Self::TaskFailed(e) => write!(f, "bot_exception: {e}"),
            Self::ConfigLoadFailed(e) => write!(f, "config_load_failed: {e}"),
            Self::ImportFailed(e) => write!(f, "import_failed: {e}"),
            Self::Catastrophic(e) => write!(f, "catastrophic: {e}"),
            Self::KeyboardInterrupt => f.write_str("keyboard_interrupt"),
        }
    }
}

/// Persisted summary of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    /// Session identifier.
    pub session_id: String,
    /// Local start time.
    pub start_time: NaiveDateTime,
    /// Local end time.
    pub end_time: NaiveDateTime,
    /// Wall-clock duration in minutes.
    pub duration_minutes: f64,
    /// Successful applications after reconciliation.
    #[serde(rename = "successful_applications", alias = "successful")]
    pub successful: u32,
    /// Failed attempts.
    #[serde(rename = "failed_applications", alias = "failed")]
    pub failed: u32,
    /// Skipped candidates.
    #[serde(default, rename = "skipped_jobs", alias = "skipped")]
    pub skipped: u32,
    /// Session target.
    #[serde(rename = "target_applications", alias = "target")]
    pub target: u32,
    /// Rendered [`ExitReason`].
    pub exit_reason: String,
    /// First errors seen, at most [`MAX_REPORT_ERRORS`].
    #[serde(default)]
    pub errors: Vec<String>,
}

impl SessionReport {
    /// Whether the session ended in failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !(self.exit_reason.starts_with("target_reached") || self.exit_reason.starts_with("completed"))
    }

    /// One-line human summary, used in notifications.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{}: {} successful, {} failed in {:.1} min",
            self.exit_reason, self.successful, self.failed, self.duration_minutes
        )
    }
}

/// Append `error` unless `errors` already holds [`MAX_REPORT_ERRORS`].
pub fn push_bounded(errors: &mut Vec<String>, error: impl Into<String>) {
    if errors.len() < MAX_REPORT_ERRORS {
        errors.push(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_reason_rendering() {
        assert_eq!(
            ExitReason::TargetReached {
                successful: 5,
                target: 5
            }
            .to_string(),
            "target_reached (5/5)"
        );
        assert_eq!(
            ExitReason::Completed {
                successful: 2,
                target: 5
            }
            .to_string(),
            "completed (2/5)"
        );
        assert_eq!(
            ExitReason::WatchdogAbort("max_runtime_exceeded".into()).to_string(),
            "watchdog_abort: max_runtime_exceeded"
        );
        assert_eq!(ExitReason::ConnectionLost.to_string(), "chrome_connection_lost");
        assert!(ExitReason::KeyboardInterrupt.is_failure());
        assert!(!ExitReason::Completed {
            successful: 0,
            target: 1
        }
        .is_failure());
    }

    #[test]
    fn test_errors_are_bounded() {
        let mut errors = Vec::new();
        for i in 0..25 {
            push_bounded(&mut errors, format!("error {i}"));
        }
        assert_eq!(errors.len(), MAX_REPORT_ERRORS);
        assert_eq!(errors[0], "error 0");
    }

    #[test]
    fn test_report_json_field_names() {
        let at = chrono::NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let report = SessionReport {
            session_id: "abc".into(),
            start_time: at,
            end_time: at,
            duration_minutes: 1.5,
            successful: 3,
            failed: 1,
            skipped: 2,
            target: 5,
            exit_reason: "completed (3/5)".into(),
            errors: vec![],
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["successful_applications"], 3);
        assert_eq!(json["failed_applications"], 1);
        assert_eq!(json["skipped_jobs"], 2);
        assert_eq!(json["target_applications"], 5);
        assert!(json.get("successful").is_none());

        let back: SessionReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_report_reads_short_field_names() {
        let json = serde_json::json!({
            "session_id": "abc",
            "start_time": "2026-03-02T09:00:00",
            "end_time": "2026-03-02T09:10:00",
            "duration_minutes": 10.0,
            "successful": 4,
            "failed": 0,
            "target": 5,
            "exit_reason": "completed (4/5)",
        });
        let report: SessionReport = serde_json::from_value(json).unwrap();
        assert_eq!(report.successful, 4);
        assert_eq!(report.target, 5);
        assert_eq!(report.skipped, 0);
    }
}
