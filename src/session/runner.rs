//! One end-to-end session.
//!
//! The runner walks a fixed sequence of numbered stages (they appear as the
//! `stage` field in logs):
//!
//! 1. load configuration and derive the target
//! 2. prepare the task with safety overrides
//! 3. start the watchdog
//! 4. snapshot the outcome ledgers
//! 5. launch the task on its own thread
//! 6. wait for it, bounded by the runtime budget and operator interrupts
//! 7. stop the watchdog
//! 8. reconcile counters with the ledgers
//! 9. decide the exit reason
//! 10. persist the report and notify
//!
//! Every failure, including a panic inside the runner, still produces a
//! report; `run_session` never returns an error.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::{ConfigSource, SchedulerConfig};
use crate::core::{ErrorCategory, RetryPolicy, SchedulerError};
use crate::infra::{LedgerCounts, LedgerSet, Notification, NotificationDispatcher, NotificationKind, TcpProbe};
use crate::scheduler::SchedulerStateStore;
use crate::session::{
    push_bounded, reconcile_successes, AlwaysAlive, ExitReason, LivenessProbe, SessionContext, SessionReport,
    SessionTask, SessionWatchdog, StopCallback, TaskCounters, TaskError, TaskLauncher, WatchdogConfig,
};
use crate::util::{panic_message, SharedClock, SystemClock, WaitOutcome, WorkerThread};

/// Runs sessions on behalf of the scheduler.
pub trait SessionDriver: Send + Sync {
    /// Run one session, never failing; `remaining_today` caps the target.
    fn run_session(&self, remaining_today: Option<u32>) -> SessionReport;
}

/// Runner timing knobs.
#[derive(Debug, Clone)]
pub struct RunnerTimings {
    /// Watchdog probe interval.
    pub watchdog_poll: Duration,
    /// Bound on waiting for the watchdog thread to exit.
    pub watchdog_join: Duration,
    /// How long a stopped task gets to wind down before it is abandoned.
    pub stop_grace: Duration,
    /// How often the wait loop checks for operator interrupts.
    pub interrupt_poll: Duration,
}

impl Default for RunnerTimings {
    fn default() -> Self {
        Self {
            watchdog_poll: Duration::from_secs(10),
            watchdog_join: Duration::from_secs(5),
            stop_grace: Duration::from_secs(30),
            interrupt_poll: Duration::from_millis(500),
        }
    }
}

#[derive(Default)]
struct Outcome {
    cfg: Option<SchedulerConfig>,
    exit: Option<ExitReason>,
    errors: Vec<String>,
    target: u32,
    counters: TaskCounters,
    successful: u32,
}

impl Outcome {
    /// First failure wins the exit reason; every failure is recorded.
    fn fail(&mut self, reason: ExitReason) {
        push_bounded(&mut self.errors, reason.to_string());
        if self.exit.is_none() {
            self.exit = Some(reason);
        }
    }

    fn note(&mut self, error: impl Into<String>) {
        push_bounded(&mut self.errors, error);
    }
}

enum Waited {
    Returned(Result<(), TaskError>),
    Panicked(String),
    DeadlineReached,
    WatchdogTripped,
    Interrupted,
}

/// Drives one task per session.
pub struct SessionRunner {
    config: ConfigSource,
    launcher: Arc<dyn TaskLauncher>,
    ledgers: LedgerSet,
    store: SchedulerStateStore,
    probe: Option<Arc<dyn LivenessProbe>>,
    notifier: Arc<NotificationDispatcher>,
    clock: SharedClock,
    timings: RunnerTimings,
    interrupt: Arc<AtomicBool>,
    ledger_retry: RetryPolicy,
}

impl std::fmt::Debug for SessionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRunner")
            .field("config", &self.config)
            .field("ledgers", &self.ledgers)
            .field("store", &self.store)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl SessionRunner {
    /// Runner with default timings, log notifications and a liveness probe
    /// derived from `liveness_address`.
    pub fn new(
        config: ConfigSource,
        launcher: Arc<dyn TaskLauncher>,
        ledgers: LedgerSet,
        store: SchedulerStateStore,
    ) -> Self {
        Self {
            config,
            launcher,
            ledgers,
            store,
            probe: None,
            notifier: Arc::new(NotificationDispatcher::new()),
            clock: SystemClock::shared(),
            timings: RunnerTimings::default(),
            interrupt: Arc::new(AtomicBool::new(false)),
            ledger_retry: RetryPolicy::new(3)
                .with_delays(Duration::from_millis(100), Duration::from_secs(1))
                .retrying([ErrorCategory::Transient, ErrorCategory::Resource]),
        }
    }

    /// Use `probe` instead of the configured address.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Share a notification dispatcher.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<NotificationDispatcher>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Override the timing knobs.
    #[must_use]
    pub fn with_timings(mut self, timings: RunnerTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Clock for report timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Share an interrupt flag, typically set from a Ctrl-C handler.
    #[must_use]
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    /// The flag that interrupts a running session.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Run one session and return its report.
    pub fn run_session(&self, remaining_today: Option<u32>) -> SessionReport {
        let session_id = Uuid::new_v4().to_string();
        let start_time = self.clock.local_now();
        let started = Instant::now();
        let span = tracing::info_span!("session", session_id = %session_id);
        let _entered = span.enter();

        let mut outcome = Outcome::default();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute(&session_id, started, remaining_today, &mut outcome);
        }));
        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            tracing::error!(%message, "session runner panicked");
            outcome.fail(ExitReason::Catastrophic(message));
        }

        let exit = outcome.exit.take().unwrap_or(ExitReason::Completed {
            successful: outcome.successful,
            target: outcome.target,
        });
        let report = SessionReport {
            session_id,
            start_time,
            end_time: self.clock.local_now(),
            duration_minutes: (started.elapsed().as_secs_f64() / 60.0 * 100.0).round() / 100.0,
            successful: outcome.successful,
            failed: outcome.counters.failed,
            skipped: outcome.counters.skipped,
            target: outcome.target,
            exit_reason: exit.to_string(),
            errors: outcome.errors,
        };

        tracing::info!(
            stage = 10,
            exit_reason = %report.exit_reason,
            successful = report.successful,
            failed = report.failed,
            "persisting session report"
        );
        if let Err(e) = self.store.save_session_report(&report) {
            tracing::error!(error = %e, "failed to persist session report");
        }
        let cfg = outcome.cfg.unwrap_or_default();
        let (kind, title) = if exit.is_failure() {
            (NotificationKind::Error, "Session failed")
        } else {
            (NotificationKind::Complete, "Session complete")
        };
        self.notifier.dispatch(&cfg, &Notification::new(kind, title, report.summary()));
        report
    }

    fn execute(&self, session_id: &str, started: Instant, remaining_today: Option<u32>, out: &mut Outcome) {
        tracing::info!(stage = 1, "loading configuration");
        let cfg = match self.config.load() {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::error!(stage = 1, error = %e, "configuration unusable");
                out.fail(ExitReason::ConfigLoadFailed(e.to_string()));
                return;
            }
        };
        out.target = remaining_today.map_or(cfg.max_applications, |left| left.min(cfg.max_applications));
        out.cfg = Some(cfg.clone());
        self.notifier.dispatch(
            &cfg,
            &Notification::new(
                NotificationKind::Start,
                "Session started",
                format!("Targeting {} applications", out.target),
            ),
        );

        tracing::info!(stage = 2, target = out.target, "preparing task");
        let prepared = self
            .launcher
            .base_settings()
            .and_then(|base| self.launcher.prepare(base.with_safety_overrides(out.target, &cfg.task)));
        let task = match prepared {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(stage = 2, error = %e, "task unavailable");
                out.fail(ExitReason::ImportFailed(e.to_string()));
                return;
            }
        };
        let ctx = Arc::new(SessionContext::new(session_id));

        tracing::info!(stage = 3, "starting watchdog");
        let on_trip: StopCallback = {
            let stop = ctx.stop_signal();
            let task = Arc::clone(&task);
            Arc::new(move |reason: &str| {
                tracing::warn!(%reason, "watchdog requested task stop");
                stop.request();
                task.request_stop();
            })
        };
        let watchdog = SessionWatchdog::new(
            WatchdogConfig {
                poll_interval: self.timings.watchdog_poll,
                max_runtime: cfg.max_runtime(),
                max_consecutive_failures: cfg.max_consecutive_liveness_failures,
                join_timeout: self.timings.watchdog_join,
            },
            self.probe_for(&cfg),
            on_trip,
        );
        if let Err(e) = watchdog.start(started) {
            tracing::warn!(stage = 3, error = %e, "watchdog unavailable, running unmonitored");
            out.note(format!("watchdog failed to start: {e}"));
        }

        tracing::info!(stage = 4, "snapshotting ledgers");
        let baseline = self.snapshot_ledgers(out);

        tracing::info!(stage = 5, "launching task");
        let deadline = cfg.max_runtime().map(|budget| started + budget);
        self.drive_task(&task, &ctx, deadline, &watchdog, out);

        tracing::info!(stage = 7, "stopping watchdog");
        watchdog.stop();
        if watchdog.should_abort() && !matches!(out.exit, Some(ExitReason::WatchdogAbort(_))) {
            let reason = watchdog.abort_reason().unwrap_or_else(|| "unknown".into());
            out.fail(ExitReason::WatchdogAbort(reason));
        }

        tracing::info!(stage = 8, "reconciling counters");
        let counters = task.counters(&ctx);
        let after = self.snapshot_ledgers(out);
        let reconciled = reconcile_successes(
            counters.successful(),
            baseline.map(|c| c.applied),
            after.map(|c| c.applied),
        );
        out.counters = counters;
        out.successful = reconciled.reported;

        if out.exit.is_none() {
            let (successful, target) = (out.successful, out.target);
            out.exit = Some(if successful >= target {
                ExitReason::TargetReached { successful, target }
            } else {
                ExitReason::Completed { successful, target }
            });
        }
        tracing::info!(stage = 9, exit_reason = ?out.exit, "session finished");
    }

    fn drive_task(
        &self,
        task: &Arc<dyn SessionTask>,
        ctx: &Arc<SessionContext>,
        deadline: Option<Instant>,
        watchdog: &SessionWatchdog,
        out: &mut Outcome,
    ) {
        let spawned = {
            let task = Arc::clone(task);
            let ctx = Arc::clone(ctx);
            WorkerThread::spawn("session-task", move || -> Result<(), TaskError> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| TaskError::Failed(format!("failed to build task runtime: {e}")))?;
                runtime.block_on(task.run(ctx))
            })
        };
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                out.fail(ExitReason::Catastrophic(format!("failed to spawn task thread: {e}")));
                return;
            }
        };

        let waited = loop {
            if self.interrupt.load(Ordering::SeqCst) {
                break Waited::Interrupted;
            }
            if watchdog.should_abort() {
                break Waited::WatchdogTripped;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break Waited::DeadlineReached;
                    }
                    left.min(self.timings.interrupt_poll)
                }
                None => self.timings.interrupt_poll,
            };
            match worker.wait(Some(slice)) {
                WaitOutcome::Finished(result) => break Waited::Returned(result),
                WaitOutcome::Panicked(message) => break Waited::Panicked(message),
                WaitOutcome::TimedOut => {}
            }
        };

        match waited {
            Waited::Returned(Ok(())) => tracing::info!(stage = 6, "task returned"),
            Waited::Returned(Err(TaskError::ConnectionLost(detail))) => {
                tracing::error!(stage = 6, %detail, "task lost its dependency");
                out.fail(ExitReason::ConnectionLost);
                out.note(detail);
            }
            Waited::Returned(Err(e)) => {
                tracing::error!(stage = 6, error = %e, "task failed");
                out.fail(ExitReason::TaskFailed(e.to_string()));
            }
            Waited::Panicked(message) => {
                tracing::error!(stage = 6, %message, "task panicked");
                out.fail(ExitReason::TaskFailed(format!("task panicked: {message}")));
            }
            Waited::DeadlineReached => {
                tracing::warn!(stage = 6, "runtime budget exhausted, stopping task");
                let reason = watchdog
                    .abort_reason()
                    .unwrap_or_else(|| "max_runtime_exceeded".into());
                out.fail(ExitReason::WatchdogAbort(reason));
                self.stop_task(task, ctx, &worker, out);
            }
            Waited::WatchdogTripped => {
                let reason = watchdog.abort_reason().unwrap_or_else(|| "unknown".into());
                tracing::warn!(stage = 6, %reason, "watchdog tripped, stopping task");
                out.fail(ExitReason::WatchdogAbort(reason));
                self.stop_task(task, ctx, &worker, out);
            }
            Waited::Interrupted => {
                tracing::warn!(stage = 6, "interrupted, stopping task");
                out.fail(ExitReason::KeyboardInterrupt);
                self.stop_task(task, ctx, &worker, out);
            }
        }
    }

    fn stop_task(
        &self,
        task: &Arc<dyn SessionTask>,
        ctx: &SessionContext,
        worker: &WorkerThread<Result<(), TaskError>>,
        out: &mut Outcome,
    ) {
        ctx.request_stop();
        task.request_stop();
        match worker.wait(Some(self.timings.stop_grace)) {
            WaitOutcome::Finished(Ok(())) => tracing::info!("task stopped"),
            WaitOutcome::Finished(Err(e)) => out.note(format!("task error while stopping: {e}")),
            WaitOutcome::Panicked(message) => out.note(format!("task panicked while stopping: {message}")),
            WaitOutcome::TimedOut => {
                tracing::error!(
                    grace_s = self.timings.stop_grace.as_secs(),
                    "task did not stop gracefully, abandoning its thread"
                );
                out.note("task did not stop gracefully");
            }
        }
    }

    fn probe_for(&self, cfg: &SchedulerConfig) -> Arc<dyn LivenessProbe> {
        if let Some(probe) = &self.probe {
            return Arc::clone(probe);
        }
        match &cfg.liveness_address {
            Some(address) => Arc::new(TcpProbe::new(address.clone())),
            None => Arc::new(AlwaysAlive),
        }
    }

    fn snapshot_ledgers(&self, out: &mut Outcome) -> Option<LedgerCounts> {
        match self.ledger_retry.run(|_| self.ledgers.snapshot()) {
            Ok(counts) => {
                tracing::debug!(applied = counts.applied, failed = counts.failed, "ledger snapshot");
                Some(counts)
            }
            Err(e) => {
                let err = SchedulerError::from(e);
                tracing::warn!(error = %err, "ledger snapshot unavailable");
                out.note(err.to_string());
                None
            }
        }
    }
}

impl SessionDriver for SessionRunner {
    fn run_session(&self, remaining_today: Option<u32>) -> SessionReport {
        Self::run_session(self, remaining_today)
    }
}
