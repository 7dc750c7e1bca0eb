//! Session watchdog.
//!
//! Polls a liveness probe on a background thread and enforces the runtime
//! budget. On trip it raises its abort flag, records a reason and invokes the
//! stop callback exactly once; the monitor thread then exits.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::HealthChecker;
use crate::util::{WaitOutcome, WorkerThread};

/// Answers whether the task's external dependency still responds.
pub trait LivenessProbe: Send + Sync {
    /// `true` while the dependency is alive.
    fn is_alive(&self) -> bool;
}

impl<F> LivenessProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_alive(&self) -> bool {
        self()
    }
}

impl LivenessProbe for HealthChecker {
    fn is_alive(&self) -> bool {
        self.is_healthy()
    }
}

/// Probe that always answers alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAlive;

impl LivenessProbe for AlwaysAlive {
    fn is_alive(&self) -> bool {
        true
    }
}

/// Callback invoked with the abort reason when the watchdog trips.
pub type StopCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Watchdog tuning.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Delay between probes.
    pub poll_interval: Duration,
    /// Session budget, measured from the start instant; `None` is unbounded.
    pub max_runtime: Option<Duration>,
    /// Failed probes in a row that trip the watchdog.
    pub max_consecutive_failures: u32,
    /// How long [`SessionWatchdog::stop`] waits for the monitor thread.
    pub join_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_runtime: None,
            max_consecutive_failures: 5,
            join_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct Shared {
    abort: AtomicBool,
    dependency_dead: AtomicBool,
    runtime_exceeded: AtomicBool,
    consecutive_failures: AtomicU32,
    reason: Mutex<Option<String>>,
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Background monitor for one session.
pub struct SessionWatchdog {
    config: WatchdogConfig,
    probe: Arc<dyn LivenessProbe>,
    on_trip: StopCallback,
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerThread<()>>>,
}

impl std::fmt::Debug for SessionWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWatchdog")
            .field("config", &self.config)
            .field("should_abort", &self.should_abort())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish_non_exhaustive()
    }
}

impl SessionWatchdog {
    /// Build an idle watchdog.
    pub fn new(config: WatchdogConfig, probe: Arc<dyn LivenessProbe>, on_trip: StopCallback) -> Self {
        Self {
            config,
            probe,
            on_trip,
            shared: Arc::new(Shared::default()),
            worker: Mutex::new(None),
        }
    }

    /// Start monitoring a session that began at `session_start`.
    ///
    /// A second call while running is a no-op.
    ///
    /// # Errors
    ///
    /// The monitor thread could not be spawned.
    pub fn start(&self, session_start: Instant) -> std::io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let config = self.config.clone();
        let probe = Arc::clone(&self.probe);
        let on_trip = Arc::clone(&self.on_trip);
        let shared = Arc::clone(&self.shared);
        *worker = Some(WorkerThread::spawn("session-watchdog", move || {
            monitor(&config, probe.as_ref(), on_trip.as_ref(), &shared, session_start);
        })?);
        tracing::debug!(
            poll_ms = self.config.poll_interval.as_millis(),
            max_runtime_s = self.config.max_runtime.map(|d| d.as_secs()),
            "watchdog started"
        );
        Ok(())
    }

    /// Cancel monitoring and wait, bounded, for the thread to exit.
    ///
    /// Safe to call repeatedly and before [`Self::start`].
    pub fn stop(&self) {
        {
            let mut cancelled = self.shared.cancelled.lock();
            *cancelled = true;
            self.shared.wake.notify_all();
        }
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        match worker.wait(Some(self.config.join_timeout)) {
            WaitOutcome::Finished(()) => tracing::debug!("watchdog stopped"),
            WaitOutcome::Panicked(message) => tracing::error!(%message, "watchdog thread panicked"),
            WaitOutcome::TimedOut => tracing::warn!("watchdog thread did not exit in time; detaching"),
        }
    }

    /// Whether the watchdog tripped.
    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.shared.abort.load(Ordering::SeqCst)
    }

    /// Why it tripped.
    #[must_use]
    pub fn abort_reason(&self) -> Option<String> {
        self.shared.reason.lock().clone()
    }

    /// Tripped on consecutive liveness failures.
    #[must_use]
    pub fn is_dependency_dead(&self) -> bool {
        self.shared.dependency_dead.load(Ordering::SeqCst)
    }

    /// Tripped on the runtime budget.
    #[must_use]
    pub fn is_runtime_exceeded(&self) -> bool {
        self.shared.runtime_exceeded.load(Ordering::SeqCst)
    }

    /// Current run of failed probes.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::SeqCst)
    }
}

impl Drop for SessionWatchdog {
    fn drop(&mut self) {
        let mut cancelled = self.shared.cancelled.lock();
        *cancelled = true;
        self.shared.wake.notify_all();
    }
}

fn trip(shared: &Shared, on_trip: &(dyn Fn(&str) + Send + Sync), reason: String) {
    tracing::warn!(%reason, "watchdog tripped");
    *shared.reason.lock() = Some(reason.clone());
    shared.abort.store(true, Ordering::SeqCst);
    on_trip(&reason);
}

fn monitor(
    config: &WatchdogConfig,
    probe: &dyn LivenessProbe,
    on_trip: &(dyn Fn(&str) + Send + Sync),
    shared: &Shared,
    session_start: Instant,
) {
    loop {
        let elapsed = session_start.elapsed();
        if let Some(max) = config.max_runtime {
            if elapsed >= max {
                shared.runtime_exceeded.store(true, Ordering::SeqCst);
                trip(
                    shared,
                    on_trip,
                    format!("max_runtime_exceeded ({:.1} min)", max.as_secs_f64() / 60.0),
                );
                return;
            }
        }

        if probe.is_alive() {
            shared.consecutive_failures.store(0, Ordering::SeqCst);
        } else {
            let failures = shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(
                failures,
                limit = config.max_consecutive_failures,
                "liveness probe failed"
            );
            if failures >= config.max_consecutive_failures {
                shared.dependency_dead.store(true, Ordering::SeqCst);
                trip(
                    shared,
                    on_trip,
                    format!("dependency unresponsive after {failures} consecutive liveness failures"),
                );
                return;
            }
        }

        // Never sleep past the runtime deadline.
        let mut wait = config.poll_interval;
        if let Some(max) = config.max_runtime {
            wait = wait.min(max.saturating_sub(session_start.elapsed()));
        }
        let mut cancelled = shared.cancelled.lock();
        if !*cancelled {
            shared.wake.wait_for(&mut cancelled, wait);
        }
        if *cancelled {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn fast_config() -> WatchdogConfig {
        WatchdogConfig {
            poll_interval: Duration::from_millis(10),
            max_runtime: None,
            max_consecutive_failures: 5,
            join_timeout: Duration::from_secs(2),
        }
    }

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_trips_after_consecutive_failures() {
        let trips = Arc::new(AtomicUsize::new(0));
        let trips_cb = Arc::clone(&trips);
        let watchdog = SessionWatchdog::new(
            fast_config(),
            Arc::new(|| false),
            Arc::new(move |_: &str| {
                trips_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        watchdog.start(Instant::now()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || watchdog.should_abort()));
        watchdog.stop();

        assert!(watchdog.is_dependency_dead());
        assert!(!watchdog.is_runtime_exceeded());
        assert_eq!(watchdog.consecutive_failures(), 5);
        assert!(watchdog.abort_reason().unwrap().contains("5 consecutive"));
        assert_eq!(trips.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_success_resets_failure_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe_calls = Arc::clone(&calls);
        // Fails four times, then succeeds once, repeating.
        let probe = move || probe_calls.fetch_add(1, Ordering::SeqCst) % 5 == 4;
        let watchdog = SessionWatchdog::new(fast_config(), Arc::new(probe), Arc::new(|_: &str| {}));
        watchdog.start(Instant::now()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) >= 20));
        watchdog.stop();
        assert!(!watchdog.should_abort());
    }

    #[test]
    fn test_runtime_budget() {
        let config = WatchdogConfig {
            poll_interval: Duration::from_secs(10),
            max_runtime: Some(Duration::from_millis(50)),
            ..fast_config()
        };
        let watchdog = SessionWatchdog::new(config, Arc::new(AlwaysAlive), Arc::new(|_: &str| {}));
        let started = Instant::now();
        watchdog.start(started).unwrap();
        assert!(wait_until(Duration::from_secs(2), || watchdog.should_abort()));
        // The long poll interval is capped by the deadline.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(watchdog.is_runtime_exceeded());
        assert!(watchdog.abort_reason().unwrap().starts_with("max_runtime_exceeded"));
        watchdog.stop();
    }

    #[test]
    fn test_stop_before_trip() {
        let watchdog = SessionWatchdog::new(
            WatchdogConfig {
                poll_interval: Duration::from_secs(60),
                ..fast_config()
            },
            Arc::new(AlwaysAlive),
            Arc::new(|_: &str| {}),
        );
        watchdog.stop();
        watchdog.start(Instant::now()).unwrap();
        let begun = Instant::now();
        watchdog.stop();
        watchdog.stop();
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert!(!watchdog.should_abort());
    }
}
