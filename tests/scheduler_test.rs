//! Integration tests for JobScheduler.
//!
//! The scheduler is driven tick by tick against a fake clock and a fake
//! session driver, then once as a real background loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;

use session_scheduler::builders::JobSchedulerBuilder;
use session_scheduler::config::{ConfigSource, ScheduleType, SchedulerConfig};
use session_scheduler::core::{InMemoryEventSink, SchedulerError};
use session_scheduler::scheduler::{JobScheduler, SchedulerStateStore, SchedulerTimings};
use session_scheduler::session::{SessionDriver, SessionReport};
use session_scheduler::util::{Clock, FakeClock};

// ============================================================================
// HELPERS
// ============================================================================

fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, d).unwrap().and_hms_opt(h, m, s).unwrap()
}

/// Reports a fixed number of successes and records the allowance it was given.
struct FakeDriver {
    clock: FakeClock,
    successes: AtomicU32,
    calls: Mutex<Vec<Option<u32>>>,
}

impl FakeDriver {
    fn new(clock: &FakeClock, successes: u32) -> Arc<Self> {
        Arc::new(Self {
            clock: clock.clone(),
            successes: AtomicU32::new(successes),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Option<u32>> {
        self.calls.lock().clone()
    }
}

impl SessionDriver for FakeDriver {
    fn run_session(&self, remaining_today: Option<u32>) -> SessionReport {
        self.calls.lock().push(remaining_today);
        let successful = self.successes.load(Ordering::SeqCst);
        let start = self.clock.local_now();
        self.clock.advance(Duration::from_secs(60));
        SessionReport {
            session_id: format!("s-{}", self.calls.lock().len()),
            start_time: start,
            end_time: self.clock.local_now(),
            duration_minutes: 1.0,
            successful,
            failed: 0,
            skipped: 0,
            target: successful,
            exit_reason: format!("completed ({successful}/{successful})"),
            errors: Vec::new(),
        }
    }
}

fn daily(times: &[&str], daily_limit: u32) -> SchedulerConfig {
    SchedulerConfig {
        enabled: true,
        schedule_type: ScheduleType::Daily,
        daily_times: times.iter().map(ToString::to_string).collect(),
        daily_limit,
        ..SchedulerConfig::default()
    }
}

fn scheduler(
    dir: &std::path::Path,
    cfg: SchedulerConfig,
    clock: &FakeClock,
    driver: Arc<FakeDriver>,
) -> JobScheduler {
    JobSchedulerBuilder::new(
        ConfigSource::Fixed(cfg),
        driver,
        SchedulerStateStore::new(dir.join("state.json")),
    )
    .clock(clock.shared())
    .build()
}

// ============================================================================
// TRIGGERS
// ============================================================================

#[test]
fn test_runs_inside_trigger_window_only_once() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::at(at(2, 8, 0, 0));
    let driver = FakeDriver::new(&clock, 2);
    let sched = scheduler(dir.path(), daily(&["09:00", "17:00"], 100), &clock, driver.clone());

    assert_eq!(sched.next_run(), Some(at(2, 9, 0, 0)));
    assert!(!sched.should_run_now());
    assert!(!sched.tick().unwrap());

    clock.set_local(at(2, 8, 59, 30));
    assert!(sched.should_run_now());
    assert!(sched.tick().unwrap());
    assert_eq!(driver.calls(), vec![Some(100)]);
    assert_eq!(sched.applications_today(), 2);

    // Still inside the 09:00 window, but that trigger already fired.
    assert_eq!(sched.next_run(), Some(at(2, 17, 0, 0)));
    assert!(!sched.tick().unwrap());
    assert_eq!(driver.calls().len(), 1);
}

#[test]
fn test_disabled_schedule_never_runs() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::at(at(2, 9, 0, 0));
    let driver = FakeDriver::new(&clock, 1);
    let cfg = SchedulerConfig {
        enabled: false,
        ..daily(&["09:00"], 100)
    };
    let sched = scheduler(dir.path(), cfg, &clock, driver.clone());

    assert_eq!(sched.get_next_run_time(), None);
    assert!(!sched.tick().unwrap());
    assert!(driver.calls().is_empty());
}

#[test]
fn test_interval_schedule_counts_from_start() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::at(at(2, 10, 0, 0));
    let driver = FakeDriver::new(&clock, 1);
    let cfg = SchedulerConfig {
        enabled: true,
        schedule_type: ScheduleType::Interval,
        interval_hours: 2.0,
        ..SchedulerConfig::default()
    };
    let sched = scheduler(dir.path(), cfg, &clock, driver.clone());

    assert_eq!(sched.next_run(), Some(at(2, 12, 0, 0)));
    clock.set_local(at(2, 11, 0, 0));
    // The cached trigger does not drift with the clock.
    assert_eq!(sched.next_run(), Some(at(2, 12, 0, 0)));
    assert!(!sched.tick().unwrap());

    clock.set_local(at(2, 12, 0, 10));
    assert!(sched.tick().unwrap());
    assert_eq!(sched.next_run(), Some(at(2, 14, 0, 0)));
}

#[test]
fn test_edited_config_file_moves_cached_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("scheduler.json");
    let write_times = |times: &[&str]| {
        let cfg = daily(times, 100);
        std::fs::write(&config_path, serde_json::to_string(&cfg).unwrap()).unwrap();
    };
    write_times(&["09:00"]);

    let clock = FakeClock::at(at(2, 10, 0, 0));
    let driver = FakeDriver::new(&clock, 1);
    let sched = JobSchedulerBuilder::new(
        ConfigSource::File(config_path.clone()),
        driver.clone(),
        SchedulerStateStore::new(dir.path().join("state.json")),
    )
    .clock(clock.shared())
    .build();

    assert!(!sched.tick().unwrap());
    assert_eq!(sched.next_run(), Some(at(3, 9, 0, 0)));

    write_times(&["14:00"]);
    clock.set_local(at(2, 13, 59, 30));

    assert_eq!(sched.get_next_run_time(), Some(at(2, 14, 0, 0)));
    assert_eq!(sched.next_run(), Some(at(2, 14, 0, 0)));
    assert!(sched.should_run_now());
    assert!(sched.tick().unwrap());
    assert_eq!(driver.calls().len(), 1);

    // The edited trigger fired; it does not fire again inside its window.
    assert!(!sched.tick().unwrap());
    assert_eq!(sched.next_run(), Some(at(3, 14, 0, 0)));
}

// ============================================================================
// DAILY ALLOWANCE
// ============================================================================

#[test]
fn test_daily_limit_blocks_until_tomorrow() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::at(at(2, 8, 59, 30));
    let driver = FakeDriver::new(&clock, 5);
    let sched = scheduler(dir.path(), daily(&["09:00", "17:00"], 5), &clock, driver.clone());

    assert!(sched.tick().unwrap());
    assert!(!sched.can_run_today());

    clock.set_local(at(2, 16, 59, 45));
    assert!(!sched.tick().unwrap());
    assert_eq!(driver.calls().len(), 1);
    assert!(matches!(sched.run_now(), Err(SchedulerError::Backend(_))));

    clock.set_local(at(3, 8, 59, 40));
    assert!(sched.can_run_today());
    assert!(sched.tick().unwrap());
    assert_eq!(driver.calls(), vec![Some(5), Some(5)]);
}

#[test]
fn test_remaining_allowance_is_passed_to_driver() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::at(at(2, 8, 59, 30));
    let driver = FakeDriver::new(&clock, 3);
    let sched = scheduler(dir.path(), daily(&["09:00", "17:00"], 10), &clock, driver.clone());

    assert!(sched.tick().unwrap());
    clock.set_local(at(2, 16, 59, 30));
    assert!(sched.tick().unwrap());
    assert_eq!(driver.calls(), vec![Some(10), Some(7)]);
    assert_eq!(sched.applications_today(), 6);
}

#[test]
fn test_run_now_counts_toward_daily_allowance() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::at(at(2, 11, 0, 0));
    let driver = FakeDriver::new(&clock, 4);
    let sched = scheduler(dir.path(), daily(&["09:00"], 8), &clock, driver.clone());

    let report = sched.run_now().unwrap();
    assert_eq!(report.successful, 4);
    sched.run_now().unwrap();
    assert_eq!(driver.calls(), vec![Some(8), Some(4)]);
    assert_eq!(sched.applications_today(), 8);
    assert!(matches!(sched.run_now(), Err(SchedulerError::Backend(_))));

    let state = SchedulerStateStore::new(dir.path().join("state.json")).load();
    assert_eq!(state.applications_today, 8);
    assert_eq!(state.last_run_date, Some(at(2, 0, 0, 0).date()));
}

// ============================================================================
// PERSISTENCE
// ============================================================================

#[test]
fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::at(at(2, 8, 59, 30));
    let driver = FakeDriver::new(&clock, 4);
    let cfg = daily(&["09:00", "17:00"], 10);
    {
        let sched = scheduler(dir.path(), cfg.clone(), &clock, driver.clone());
        assert!(sched.tick().unwrap());
    }

    let state = SchedulerStateStore::new(dir.path().join("state.json")).load();
    assert_eq!(state.applications_today, 4);
    assert_eq!(state.last_run_date, Some(at(2, 0, 0, 0).date()));
    assert_eq!(state.next_scheduled_run, Some(at(2, 17, 0, 0)));

    let restarted = scheduler(dir.path(), cfg, &clock, driver);
    assert_eq!(restarted.applications_today(), 4);
    assert_eq!(restarted.next_run(), Some(at(2, 17, 0, 0)));
}

#[test]
fn test_invalid_config_fails_tick() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::at(at(2, 9, 0, 0));
    let cfg = SchedulerConfig {
        daily_times: vec!["25:99".into()],
        ..daily(&[], 10)
    };
    let sched = scheduler(dir.path(), cfg, &clock, FakeDriver::new(&clock, 1));
    assert!(matches!(sched.tick(), Err(SchedulerError::Config(_))));
}

// ============================================================================
// BACKGROUND LOOP
// ============================================================================

#[test]
fn test_loop_starts_and_stops_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::at(at(2, 8, 59, 30));
    let driver = FakeDriver::new(&clock, 1);
    let events = Arc::new(InMemoryEventSink::new(64));
    let sched = JobSchedulerBuilder::new(
        ConfigSource::Fixed(daily(&["09:00"], 10)),
        driver.clone(),
        SchedulerStateStore::new(dir.path().join("state.json")),
    )
    .clock(clock.shared())
    .events(events.clone())
    .timings(SchedulerTimings {
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        stop_timeout: Duration::from_secs(2),
    })
    .build();

    sched.start().unwrap();
    sched.start().unwrap();
    assert!(sched.is_running());

    let deadline = Instant::now() + Duration::from_secs(2);
    while driver.calls().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let stopping = Instant::now();
    sched.stop();
    assert!(stopping.elapsed() < Duration::from_secs(2));
    assert!(!sched.is_running());

    assert_eq!(driver.calls().len(), 1);
    let names = events.names();
    assert_eq!(names.first(), Some(&"started"));
    assert_eq!(names.last(), Some(&"stopped"));
    assert!(names.contains(&"session_started"));
    assert!(names.contains(&"session_completed"));
}
