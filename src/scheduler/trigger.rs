//! Next-trigger computation.
//!
//! Pure functions of configuration, the previous run and "now", all in local
//! naive time, so they can be tested without a clock.

use chrono::{Datelike, Duration, NaiveDateTime};

use crate::config::{ConfigError, ScheduleType, SchedulerConfig};

/// Half-width, in seconds, of the window around a trigger in which a run may start.
pub const TRIGGER_WINDOW_SECS: i64 = 60;

/// [`TRIGGER_WINDOW_SECS`] as a duration.
#[must_use]
pub fn trigger_window() -> Duration {
    Duration::seconds(TRIGGER_WINDOW_SECS)
}

/// Days scanned ahead for weekly schedules.
const WEEKLY_SCAN_DAYS: i64 = 8;

/// Next trigger strictly after `now`, or `None` when nothing is scheduled.
///
/// Interval schedules run `interval_hours` after `last_run`; a trigger that
/// already slipped out of the run window restarts the interval from `now`.
///
/// # Errors
///
/// Unparseable trigger times.
pub fn next_run_time(
    cfg: &SchedulerConfig,
    now: NaiveDateTime,
    last_run: Option<NaiveDateTime>,
) -> Result<Option<NaiveDateTime>, ConfigError> {
    if !cfg.enabled {
        return Ok(None);
    }
    match cfg.schedule_type {
        ScheduleType::Interval => {
            let interval = cfg.interval();
            if interval <= Duration::zero() {
                return Ok(None);
            }
            let next = match last_run {
                Some(last) if last + interval >= now - trigger_window() => last + interval,
                _ => now + interval,
            };
            Ok(Some(next))
        }
        ScheduleType::Daily => {
            let times = cfg.daily_trigger_times()?;
            if times.is_empty() {
                return Ok(None);
            }
            let today = now.date();
            let upcoming = times.iter().map(|t| today.and_time(*t)).find(|at| *at > now);
            Ok(upcoming.or_else(|| today.succ_opt().map(|tomorrow| tomorrow.and_time(times[0]))))
        }
        ScheduleType::Weekly => {
            for offset in 0..WEEKLY_SCAN_DAYS {
                let day = now.date() + Duration::days(offset);
                for time in cfg.weekly_trigger_times(day.weekday())? {
                    let at = day.and_time(time);
                    if at > now {
                        return Ok(Some(at));
                    }
                }
            }
            Ok(None)
        }
    }
}

/// Whether `now` falls inside the run window around `next`.
#[must_use]
pub fn within_window(next: NaiveDateTime, now: NaiveDateTime) -> bool {
    (next - now).abs() < trigger_window()
}
