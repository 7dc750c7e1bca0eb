//! Clock abstraction so time-dependent state machines can be tested.
//!
//! Two views of "now" are exposed: a monotonic [`Instant`] for durations
//! (breaker recovery, lease aging, token refill) and a local wall-clock
//! [`NaiveDateTime`] for schedule computation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// Monotonic time.
    fn now(&self) -> Instant;
    /// Local wall-clock time.
    fn local_now(&self) -> NaiveDateTime;
}

/// Clock shared between components.
pub type SharedClock = Arc<dyn Clock>;

/// Real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Shared handle to the system clock.
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Fake clock for tests; both views move together on [`FakeClock::advance`].
#[derive(Debug, Clone)]
pub struct FakeClock {
    current: Arc<Mutex<(Instant, NaiveDateTime)>>,
}

impl FakeClock {
    /// Start at the real current time.
    #[must_use]
    pub fn new() -> Self {
        Self::at(Local::now().naive_local())
    }

    /// Start at a specific wall-clock time.
    #[must_use]
    pub fn at(local: NaiveDateTime) -> Self {
        Self {
            current: Arc::new(Mutex::new((Instant::now(), local))),
        }
    }

    /// Advance both views by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock();
        current.0 += duration;
        current.1 += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
    }

    /// Jump the wall clock to `local`, moving the monotonic view by the same
    /// amount when going forward.
    pub fn set_local(&self, local: NaiveDateTime) {
        let mut current = self.current.lock();
        if let Ok(delta) = (local - current.1).to_std() {
            current.0 += delta;
        }
        current.1 = local;
    }

    /// Shared handle to this clock.
    #[must_use]
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.current.lock().0
    }

    fn local_now(&self) -> NaiveDateTime {
        self.current.lock().1
    }
}
