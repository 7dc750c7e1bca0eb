//! Three-state circuit breaker guarding calls to a flaky dependency.
//!
//! State moves Closed → Open once `failure_threshold` failures accumulate,
//! Open → HalfOpen when `state()` is read after `recovery_timeout`,
//! HalfOpen → Closed after `half_open_max_calls` consecutive successes and
//! HalfOpen → Open on any failure. There is no background timer: callers poll
//! `can_execute()` before each protected call and the Open → HalfOpen flip is
//! computed on that read.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::clock::{SharedClock, SystemClock};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are refused until the recovery timeout elapses.
    Open,
    /// A bounded number of probe calls are admitted.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Tunables for a [`Breaker`].
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures in the closed state before opening.
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting probes.
    pub recovery_timeout: Duration,
    /// Probe calls admitted (and successes required) while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

/// Outcome of a call routed through a breaker.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker refused the call without invoking it.
    #[error("circuit breaker `{name}` is open")]
    Open {
        /// Name of the refusing breaker.
        name: String,
    },
    /// The protected call ran and failed.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure_time: Option<Instant>,
}

impl BreakerInner {
    const fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure_time: None,
        }
    }
}

/// Circuit breaker protecting one dependency for the life of the process.
pub struct Breaker {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl fmt::Debug for Breaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &*self.inner.lock())
            .finish_non_exhaustive()
    }
}

impl Breaker {
    /// Create a breaker using the system clock.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, SystemClock::shared())
    }

    /// Create a breaker reading time from `clock`.
    pub fn with_clock(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner::closed()),
        }
    }

    /// Breaker name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, flipping Open → HalfOpen if the recovery timeout has elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Failures counted since the last reset or decay.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let elapsed = inner
            .last_failure_time
            .map_or(Duration::MAX, |at| self.clock.now().saturating_duration_since(at));
        if elapsed >= self.config.recovery_timeout {
            inner.state = BreakerState::HalfOpen;
            inner.half_open_calls = 0;
            inner.success_count = 0;
            tracing::info!(breaker = %self.name, "breaker half-open, admitting probes");
        }
    }

    /// Whether a call may proceed. Admissions while half-open are counted.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    *inner = BreakerInner::closed();
                    tracing::info!(breaker = %self.name, "breaker closed after successful probes");
                }
            }
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_time = Some(self.clock.now());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.success_count = 0;
                tracing::warn!(breaker = %self.name, "probe failed, breaker re-opened");
            }
            BreakerState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = BreakerState::Open;
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "failure threshold reached, breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Force the breaker back to closed with cleared counters.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::closed();
    }

    /// Run `f` through the breaker.
    ///
    /// # Errors
    ///
    /// [`BreakerError::Open`] when the call is refused, otherwise the call's
    /// own error wrapped in [`BreakerError::Inner`].
    pub fn call<T, E, F>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.can_execute() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }
        self.observe(f()).map_err(BreakerError::Inner)
    }

    /// Run `f` through the breaker, answering with `fallback` when refused.
    ///
    /// # Errors
    ///
    /// The protected call's error when it ran and failed.
    pub fn call_with_fallback<T, E, F, G>(&self, f: F, fallback: G) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        G: FnOnce() -> T,
    {
        if !self.can_execute() {
            tracing::debug!(breaker = %self.name, "breaker open, using fallback");
            return Ok(fallback());
        }
        self.observe(f())
    }

    fn observe<T, E>(&self, result: Result<T, E>) -> Result<T, E> {
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::FakeClock;

    fn breaker(clock: &FakeClock) -> Breaker {
        Breaker::with_clock(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(30),
                half_open_max_calls: 2,
            },
            clock.shared(),
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let clock = FakeClock::new();
        let b = breaker(&clock);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_execute());
    }

    #[test]
    fn test_half_open_after_recovery_timeout_on_read() {
        let clock = FakeClock::new();
        let b = breaker(&clock);
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(Duration::from_secs(29));
        assert_eq!(b.state(), BreakerState::Open);
        clock.advance(Duration::from_secs(1));
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let clock = FakeClock::new();
        let b = breaker(&clock);
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(Duration::from_secs(30));
        assert!(b.can_execute());
        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.can_execute());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_half_open_admits_bounded_probes() {
        let clock = FakeClock::new();
        let b = breaker(&clock);
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(Duration::from_secs(31));
        assert!(b.can_execute());
        assert!(b.can_execute());
        assert!(!b.can_execute());
    }

    #[test]
    fn test_failure_while_half_open_reopens() {
        let clock = FakeClock::new();
        let b = breaker(&clock);
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(Duration::from_secs(30));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_success_decays_failures_when_closed() {
        let clock = FakeClock::new();
        let b = breaker(&clock);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_call_refused_when_open() {
        let clock = FakeClock::new();
        let b = breaker(&clock);
        for _ in 0..3 {
            let _ = b.call(|| Err::<(), _>("boom"));
        }
        let mut invoked = false;
        let result = b.call(|| {
            invoked = true;
            Ok::<_, &str>(1)
        });
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(!invoked);

        let value = b.call_with_fallback(|| Ok::<_, &str>(1), || 7);
        assert_eq!(value, Ok(7));
    }

    #[test]
    fn test_reset() {
        let clock = FakeClock::new();
        let b = breaker(&clock);
        for _ in 0..3 {
            b.record_failure();
        }
        b.reset();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.can_execute());
    }
}
