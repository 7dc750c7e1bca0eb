//! Declarative schedule and session limits.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::task::TaskOverrides;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The JSON did not match the schema.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How triggers are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Every `interval_hours` after the previous run.
    Interval,
    /// At each of `daily_times`, every day.
    #[default]
    Daily,
    /// At per-weekday times from `weekly`.
    Weekly,
}

/// Notification channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMethod {
    /// Send nothing.
    None,
    /// Log the notification only.
    #[default]
    Log,
    /// Desktop notification (`notify-send` / `osascript`).
    Desktop,
    /// Mail through the local `sendmail`.
    Email,
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Master switch; a disabled schedule never triggers.
    pub enabled: bool,
    /// Trigger computation.
    pub schedule_type: ScheduleType,
    /// Hours between runs for interval schedules.
    pub interval_hours: f64,
    /// `HH:MM` times for daily schedules.
    pub daily_times: Vec<String>,
    /// Weekday name (`monday` or `mon`) to `HH:MM` times.
    pub weekly: BTreeMap<String, Vec<String>>,
    /// Hard session runtime; zero or negative means unbounded.
    pub max_runtime_minutes: f64,
    /// Successful applications that end a session.
    pub max_applications: u32,
    /// Successful applications allowed per calendar day.
    pub daily_limit: u32,
    /// Notification channel.
    pub notification_method: NotificationMethod,
    /// Recipient for [`NotificationMethod::Email`].
    pub notification_email: Option<String>,
    /// Notify when a session starts.
    pub notify_on_start: bool,
    /// Notify when a session completes.
    pub notify_on_complete: bool,
    /// Notify when a session fails.
    pub notify_on_error: bool,
    /// Consecutive liveness failures before the watchdog aborts.
    pub max_consecutive_liveness_failures: u32,
    /// `host:port` of the task's dependency, probed for liveness.
    pub liveness_address: Option<String>,
    /// Task-specific overrides applied before each run.
    pub task: TaskOverrides,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule_type: ScheduleType::Daily,
            interval_hours: 4.0,
            daily_times: vec!["09:00".into()],
            weekly: BTreeMap::new(),
            max_runtime_minutes: 120.0,
            max_applications: 50,
            daily_limit: 100,
            notification_method: NotificationMethod::Log,
            notification_email: None,
            notify_on_start: true,
            notify_on_complete: true,
            notify_on_error: true,
            max_consecutive_liveness_failures: 5,
            liveness_address: None,
            task: TaskOverrides::default(),
        }
    }
}

/// Parse an `HH:MM` time.
///
/// # Errors
///
/// [`ConfigError::Invalid`] for anything else.
pub fn parse_hhmm(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| ConfigError::Invalid(format!("time `{value}` is not HH:MM: {e}")))
}

fn parse_sorted(values: &[String]) -> Result<Vec<NaiveTime>, ConfigError> {
    let mut times = values.iter().map(|v| parse_hhmm(v)).collect::<Result<Vec<_>, _>>()?;
    times.sort();
    times.dedup();
    Ok(times)
}

impl SchedulerConfig {
    /// Validate value ranges and time formats.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule_type == ScheduleType::Interval
            && (!self.interval_hours.is_finite() || self.interval_hours <= 0.0)
        {
            return Err(ConfigError::Invalid("interval_hours must be greater than 0".into()));
        }
        if self.daily_limit == 0 {
            return Err(ConfigError::Invalid("daily_limit must be greater than 0".into()));
        }
        if self.max_applications == 0 {
            return Err(ConfigError::Invalid("max_applications must be greater than 0".into()));
        }
        if self.max_consecutive_liveness_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_liveness_failures must be greater than 0".into(),
            ));
        }
        parse_sorted(&self.daily_times)?;
        for (day, times) in &self.weekly {
            Weekday::from_str(day)
                .map_err(|_| ConfigError::Invalid(format!("unknown weekday `{day}`")))?;
            parse_sorted(times)?;
        }
        if self.notification_method == NotificationMethod::Email && self.notification_email.is_none() {
            return Err(ConfigError::Invalid(
                "notification_email is required for email notifications".into(),
            ));
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failures.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(input)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `path`; a missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Read, parse or validation failures.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_json_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Sorted daily trigger times.
    ///
    /// # Errors
    ///
    /// A time that is not `HH:MM`.
    pub fn daily_trigger_times(&self) -> Result<Vec<NaiveTime>, ConfigError> {
        parse_sorted(&self.daily_times)
    }

    /// Sorted trigger times configured for `day`.
    ///
    /// # Errors
    ///
    /// A time that is not `HH:MM`.
    pub fn weekly_trigger_times(&self, day: Weekday) -> Result<Vec<NaiveTime>, ConfigError> {
        let mut times = Vec::new();
        for (name, values) in &self.weekly {
            if Weekday::from_str(name).is_ok_and(|d| d == day) {
                times.extend(parse_sorted(values)?);
            }
        }
        times.sort();
        times.dedup();
        Ok(times)
    }

    /// Interval between runs for interval schedules.
    #[must_use]
    pub fn interval(&self) -> chrono::Duration {
        let millis = (self.interval_hours.max(0.0) * 3_600_000.0).round();
        // Hours beyond i64 milliseconds are not meaningful schedules.
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        let millis = millis.min(i64::MAX as f64) as i64;
        chrono::Duration::milliseconds(millis)
    }

    /// Session runtime budget, `None` when unbounded.
    #[must_use]
    pub fn max_runtime(&self) -> Option<Duration> {
        let minutes = self.max_runtime_minutes;
        if minutes.is_finite() && minutes > 0.0 {
            Duration::try_from_secs_f64(minutes * 60.0).ok()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let cfg = SchedulerConfig::from_json_str(
            r#"{
                "enabled": true,
                "schedule_type": "weekly",
                "weekly": {"monday": ["17:00", "09:00"], "Fri": ["12:30"]},
                "max_applications": 5
            }"#,
        )
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.daily_limit, 100);
        assert_eq!(
            cfg.weekly_trigger_times(Weekday::Mon).unwrap(),
            vec![parse_hhmm("09:00").unwrap(), parse_hhmm("17:00").unwrap()]
        );
        assert_eq!(cfg.weekly_trigger_times(Weekday::Fri).unwrap().len(), 1);
        assert!(cfg.weekly_trigger_times(Weekday::Tue).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_time_rejected() {
        let result = SchedulerConfig::from_json_str(r#"{"daily_times": ["9am"]}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_weekday_rejected() {
        let result = SchedulerConfig::from_json_str(r#"{"weekly": {"someday": ["09:00"]}}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_interval_must_be_positive() {
        let result =
            SchedulerConfig::from_json_str(r#"{"schedule_type": "interval", "interval_hours": 0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_email_requires_recipient() {
        let result = SchedulerConfig::from_json_str(r#"{"notification_method": "email"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_max_runtime_unbounded_when_not_positive() {
        let mut cfg = SchedulerConfig::default();
        cfg.max_runtime_minutes = 0.0;
        assert_eq!(cfg.max_runtime(), None);
        cfg.max_runtime_minutes = -1.0;
        assert_eq!(cfg.max_runtime(), None);
        cfg.max_runtime_minutes = 2.0;
        assert_eq!(cfg.max_runtime(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SchedulerConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg, SchedulerConfig::default());
    }
}
