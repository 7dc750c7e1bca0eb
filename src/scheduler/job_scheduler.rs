//! Background scheduling loop.
//!
//! A single named thread wakes every poll interval, reloads configuration,
//! and runs a session when a trigger falls inside the run window and today's
//! allowance is not yet used up. A failing tick is logged, reported as an
//! event and followed by a longer back-off; the loop itself never dies.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::{Condvar, Mutex};

use crate::config::{ConfigSource, ScheduleType, SchedulerConfig};
use crate::core::{build_event, SchedulerError, SchedulerEvent, SharedEventSink, TracingEventSink};
use crate::infra::{Notification, NotificationDispatcher, NotificationKind};
use crate::scheduler::{next_run_time, trigger_window, within_window, SchedulerStateStore};
use crate::session::{SessionDriver, SessionReport};
use crate::util::{panic_message, SharedClock, SystemClock, WaitOutcome, WorkerThread};

/// Loop timing knobs.
#[derive(Debug, Clone)]
pub struct SchedulerTimings {
    /// Delay between ticks.
    pub poll_interval: Duration,
    /// Delay after a failed tick.
    pub error_backoff: Duration,
    /// Bound on waiting for the loop thread in [`JobScheduler::stop`].
    ///
    /// Must outlast an interrupted session's stop grace and watchdog join,
    /// or the session's report is lost when the process exits.
    pub stop_timeout: Duration,
}

impl Default for SchedulerTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(45),
        }
    }
}

/// The configuration fields a cached trigger was derived from.
#[derive(Debug, Clone, PartialEq)]
struct ScheduleKey {
    schedule_type: ScheduleType,
    interval_hours: f64,
    daily_times: Vec<String>,
    weekly: BTreeMap<String, Vec<String>>,
}

impl ScheduleKey {
    fn of(cfg: &SchedulerConfig) -> Self {
        Self {
            schedule_type: cfg.schedule_type,
            interval_hours: cfg.interval_hours,
            daily_times: cfg.daily_times.clone(),
            weekly: cfg.weekly.clone(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Bookkeeping {
    applications_today: u32,
    last_run_date: Option<NaiveDate>,
    last_run: Option<NaiveDateTime>,
    next_run: Option<NaiveDateTime>,
    /// Schedule `next_run` was computed for; `None` until first checked.
    schedule: Option<ScheduleKey>,
    /// Triggers at or before this instant have already been handled.
    not_before: Option<NaiveDateTime>,
    limit_notified_on: Option<NaiveDate>,
}

struct Inner {
    config: ConfigSource,
    driver: Arc<dyn SessionDriver>,
    store: SchedulerStateStore,
    clock: SharedClock,
    events: SharedEventSink,
    notifier: Arc<NotificationDispatcher>,
    timings: SchedulerTimings,
    book: Mutex<Bookkeeping>,
    shutdown: Mutex<bool>,
    wake: Condvar,
    running: AtomicBool,
}

/// Scheduler that runs sessions on a background thread.
pub struct JobScheduler {
    inner: Arc<Inner>,
    worker: Mutex<Option<WorkerThread<()>>>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("running", &self.is_running())
            .field("book", &*self.inner.book.lock())
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    /// Scheduler resuming from the persisted state in `store`, with the
    /// system clock, tracing events and default timings.
    ///
    /// Use [`crate::builders::JobSchedulerBuilder`] to override those.
    pub fn new(config: ConfigSource, driver: Arc<dyn SessionDriver>, store: SchedulerStateStore) -> Self {
        Self::assemble(
            config,
            driver,
            store,
            SystemClock::shared(),
            Arc::new(TracingEventSink),
            Arc::new(NotificationDispatcher::new()),
            SchedulerTimings::default(),
        )
    }

    pub(crate) fn assemble(
        config: ConfigSource,
        driver: Arc<dyn SessionDriver>,
        store: SchedulerStateStore,
        clock: SharedClock,
        events: SharedEventSink,
        notifier: Arc<NotificationDispatcher>,
        timings: SchedulerTimings,
    ) -> Self {
        let state = store.load();
        let book = Bookkeeping {
            applications_today: state.applications_today,
            last_run_date: state.last_run_date,
            last_run: state.last_run_time,
            next_run: state.next_scheduled_run,
            schedule: None,
            not_before: state.last_run_time.map(|at| at + trigger_window()),
            limit_notified_on: None,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                driver,
                store,
                clock,
                events,
                notifier,
                timings,
                book: Mutex::new(book),
                shutdown: Mutex::new(false),
                wake: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the background loop. A second call while running is a no-op.
    ///
    /// # Errors
    ///
    /// The loop thread could not be spawned.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            tracing::debug!("scheduler already running");
            return Ok(());
        }
        *self.inner.shutdown.lock() = false;
        self.inner.emit(SchedulerEvent::Started);
        let next_run = self.next_run();
        let inner = Arc::clone(&self.inner);
        let spawned = WorkerThread::spawn("job-scheduler", move || inner.run_loop()).map_err(|e| {
            let err = SchedulerError::Backend(format!("failed to spawn scheduler thread: {e}"));
            self.inner.emit(SchedulerEvent::Error { message: err.to_string() });
            err
        })?;
        *worker = Some(spawned);
        self.inner.running.store(true, Ordering::SeqCst);
        tracing::info!(next_run = %describe(next_run), "scheduler started");
        if let Ok(cfg) = self.inner.config.load() {
            self.inner.notifier.dispatch(
                &cfg,
                &Notification::new(
                    NotificationKind::Start,
                    "Scheduler started",
                    format!("Next run: {}", describe(next_run)),
                ),
            );
        }
        Ok(())
    }

    /// Stop the loop, waiting up to the configured bound, then persist state.
    ///
    /// A session already in progress is not interrupted here; use the
    /// runner's interrupt flag for that.
    pub fn stop(&self) {
        {
            let mut shutdown = self.inner.shutdown.lock();
            *shutdown = true;
            self.inner.wake.notify_all();
        }
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        match worker.wait(Some(self.inner.timings.stop_timeout)) {
            WaitOutcome::Finished(()) => tracing::info!("scheduler loop stopped"),
            WaitOutcome::Panicked(message) => tracing::error!(%message, "scheduler loop panicked"),
            WaitOutcome::TimedOut => tracing::warn!(
                timeout_s = self.inner.timings.stop_timeout.as_secs(),
                "scheduler loop did not stop in time; detaching"
            ),
        }
        self.inner.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.inner.persist() {
            tracing::error!(error = %e, "failed to persist scheduler state on stop");
        }
        self.inner.emit(SchedulerEvent::Stopped);
    }

    /// Whether the loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Next trigger computed fresh from configuration and the last run.
    #[must_use]
    pub fn get_next_run_time(&self) -> Option<NaiveDateTime> {
        let cfg = self.inner.load_config()?;
        self.inner.compute_next(&cfg, self.inner.earliest_start())
    }

    /// The trigger the loop is waiting for.
    #[must_use]
    pub fn next_run(&self) -> Option<NaiveDateTime> {
        let cfg = self.inner.load_config()?;
        self.inner.refresh_next_run(&cfg)
    }

    /// Whether a run is due now.
    #[must_use]
    pub fn should_run_now(&self) -> bool {
        self.inner
            .load_config()
            .is_some_and(|cfg| cfg.enabled && self.inner.due(&cfg).is_some())
    }

    /// Whether today's allowance has room, resetting the count on a new day.
    #[must_use]
    pub fn can_run_today(&self) -> bool {
        self.inner
            .load_config()
            .is_some_and(|cfg| self.inner.remaining_today(&cfg) > 0)
    }

    /// Successes counted toward today's limit.
    #[must_use]
    pub fn applications_today(&self) -> u32 {
        let today = self.inner.clock.local_now().date();
        let book = self.inner.book.lock();
        if book.last_run_date == Some(today) {
            book.applications_today
        } else {
            0
        }
    }

    /// One loop iteration; returns whether a session ran.
    ///
    /// # Errors
    ///
    /// Configuration or state persistence failures.
    pub fn tick(&self) -> Result<bool, SchedulerError> {
        self.inner.tick()
    }

    /// Run a session immediately, ignoring the trigger but honoring the
    /// daily allowance.
    ///
    /// # Errors
    ///
    /// Configuration failures, or [`SchedulerError::Backend`] when today's
    /// allowance is used up.
    pub fn run_now(&self) -> Result<SessionReport, SchedulerError> {
        let cfg = self.inner.config.load()?;
        if self.inner.remaining_today(&cfg) == 0 {
            return Err(SchedulerError::Backend(format!(
                "daily limit of {} applications reached",
                cfg.daily_limit
            )));
        }
        let fired_at = self.inner.clock.local_now();
        self.inner.run_session(&cfg, fired_at)
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        let mut shutdown = self.inner.shutdown.lock();
        *shutdown = true;
        self.inner.wake.notify_all();
    }
}

fn describe(at: Option<NaiveDateTime>) -> String {
    at.map_or_else(|| "not scheduled".into(), |at| at.format("%Y-%m-%d %H:%M").to_string())
}

impl Inner {
    fn emit(&self, event: SchedulerEvent) {
        self.events.record(build_event(event));
    }

    fn load_config(&self) -> Option<SchedulerConfig> {
        match self.config.load() {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                tracing::error!(error = %e, "scheduler configuration unusable");
                None
            }
        }
    }

    fn compute_next(&self, cfg: &SchedulerConfig, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let last_run = self.book.lock().last_run;
        match next_run_time(cfg, now, last_run) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(error = %e, "cannot compute next run");
                None
            }
        }
    }

    /// Now, or later when the trigger just handled is still inside the window.
    fn earliest_start(&self) -> NaiveDateTime {
        let now = self.clock.local_now();
        self.book.lock().not_before.map_or(now, |floor| floor.max(now))
    }

    /// Cached trigger, recomputed when absent, missed, or derived from a
    /// schedule that has since been edited.
    fn refresh_next_run(&self, cfg: &SchedulerConfig) -> Option<NaiveDateTime> {
        if !cfg.enabled {
            return None;
        }
        let now = self.clock.local_now();
        let key = ScheduleKey::of(cfg);
        let (cached, unchanged) = {
            let book = self.book.lock();
            (book.next_run, book.schedule.as_ref().is_none_or(|k| *k == key))
        };
        match cached {
            Some(next) if unchanged && next + trigger_window() > now => {
                self.book.lock().schedule = Some(key);
                return Some(next);
            }
            Some(next) if unchanged => tracing::warn!(missed = %next, "missed scheduled run"),
            _ if !unchanged => tracing::info!("schedule changed, recomputing next run"),
            _ => {}
        }
        let next = self.compute_next(cfg, self.earliest_start());
        {
            let mut book = self.book.lock();
            book.next_run = next;
            book.schedule = Some(key);
        }
        self.emit(SchedulerEvent::NextRunScheduled { at: next });
        next
    }

    /// The trigger to fire now, if one is inside the run window.
    fn due(&self, cfg: &SchedulerConfig) -> Option<NaiveDateTime> {
        let next = self.refresh_next_run(cfg)?;
        within_window(next, self.clock.local_now()).then_some(next)
    }

    fn remaining_today(&self, cfg: &SchedulerConfig) -> u32 {
        let today = self.clock.local_now().date();
        let mut book = self.book.lock();
        if book.last_run_date != Some(today) {
            book.applications_today = 0;
            book.last_run_date = Some(today);
            book.limit_notified_on = None;
        }
        cfg.daily_limit.saturating_sub(book.applications_today)
    }

    fn persist(&self) -> Result<(), SchedulerError> {
        let book = self.book.lock().clone();
        self.store
            .save_tick(book.applications_today, book.last_run_date, book.next_run)?;
        Ok(())
    }

    fn run_loop(&self) {
        tracing::debug!("scheduler loop running");
        loop {
            let delay = match panic::catch_unwind(AssertUnwindSafe(|| self.tick())) {
                Ok(Ok(_)) => self.timings.poll_interval,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "scheduler tick failed");
                    self.emit(SchedulerEvent::Error { message: e.to_string() });
                    self.timings.error_backoff
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(%message, "scheduler tick panicked");
                    self.emit(SchedulerEvent::Error { message });
                    self.timings.error_backoff
                }
            };
            let mut shutdown = self.shutdown.lock();
            if !*shutdown {
                self.wake.wait_for(&mut shutdown, delay);
            }
            if *shutdown {
                return;
            }
        }
    }

    fn tick(&self) -> Result<bool, SchedulerError> {
        let cfg = self.config.load()?;
        if !cfg.enabled {
            return Ok(false);
        }
        let Some(fired_at) = self.due(&cfg) else {
            return Ok(false);
        };
        if self.remaining_today(&cfg) == 0 {
            let today = self.clock.local_now().date();
            let first_notice = {
                let mut book = self.book.lock();
                let first = book.limit_notified_on != Some(today);
                book.limit_notified_on = Some(today);
                // Skip this trigger so the window is not re-evaluated every poll.
                book.next_run = None;
                book.not_before = Some(fired_at + trigger_window());
                first
            };
            if first_notice {
                tracing::info!(daily_limit = cfg.daily_limit, "daily limit reached, skipping run");
            }
            let next = self.compute_next(&cfg, self.earliest_start());
            self.book.lock().next_run = next;
            self.emit(SchedulerEvent::NextRunScheduled { at: next });
            self.persist()?;
            return Ok(false);
        }
        self.run_session(&cfg, fired_at)?;
        Ok(true)
    }

    fn run_session(&self, cfg: &SchedulerConfig, fired_at: NaiveDateTime) -> Result<SessionReport, SchedulerError> {
        let remaining = self.remaining_today(cfg);
        let target = remaining.min(cfg.max_applications);
        tracing::info!(target, remaining, "starting scheduled session");
        self.emit(SchedulerEvent::SessionStarted { target });

        let report = self.driver.run_session(Some(remaining));

        let now = self.clock.local_now();
        let applications_today = {
            let mut book = self.book.lock();
            let today = now.date();
            if book.last_run_date != Some(today) {
                book.applications_today = 0;
            }
            book.applications_today = book.applications_today.saturating_add(report.successful);
            book.last_run_date = Some(today);
            book.last_run = Some(fired_at.min(report.start_time));
            book.next_run = None;
            book.not_before = Some(fired_at + trigger_window());
            book.schedule = Some(ScheduleKey::of(cfg));
            book.applications_today
        };
        // `not_before` keeps the trigger that just ran from firing again.
        let next_run = self.compute_next(cfg, self.earliest_start());
        self.book.lock().next_run = next_run;

        self.emit(SchedulerEvent::SessionCompleted {
            session_id: report.session_id.clone(),
            successful: report.successful,
            exit_reason: report.exit_reason.clone(),
        });
        self.emit(SchedulerEvent::NextRunScheduled { at: next_run });
        tracing::info!(
            exit_reason = %report.exit_reason,
            applications_today,
            next_run = %describe(next_run),
            "session finished"
        );
        if applications_today >= cfg.daily_limit {
            self.notifier.dispatch(
                cfg,
                &Notification::new(
                    NotificationKind::Complete,
                    "Daily limit reached",
                    format!("{applications_today} applications today; resuming tomorrow"),
                ),
            );
        }
        self.persist()?;
        Ok(report)
    }
}
