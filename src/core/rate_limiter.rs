//! Token-bucket throttle for outbound call pacing.

use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::util::clock::{SharedClock, SystemClock};

const WAIT_STEP: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilled at `rate` tokens per second up to `burst`.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    clock: SharedClock,
    bucket: Mutex<Bucket>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .field("bucket", &*self.bucket.lock())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a full bucket using the system clock.
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::with_clock(rate, burst, SystemClock::shared())
    }

    /// Create a full bucket reading time from `clock`.
    #[must_use]
    pub fn with_clock(rate: f64, burst: u32, clock: SharedClock) -> Self {
        let burst = f64::from(burst.max(1));
        let now = clock.now();
        Self {
            rate: rate.max(0.0),
            burst,
            clock,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: now,
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = elapsed.mul_add(self.rate, bucket.tokens).min(self.burst);
        bucket.last_refill = now;
    }

    /// Tokens currently available (after refill).
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Take `n` tokens if present, without waiting.
    pub fn try_acquire(&self, n: u32) -> bool {
        let needed = f64::from(n);
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Take `n` tokens, waiting up to `timeout` when `blocking`.
    ///
    /// A request larger than `burst` can never be satisfied and returns false
    /// immediately. The deadline is measured on the limiter's clock.
    pub fn acquire(&self, n: u32, blocking: bool, timeout: Duration) -> bool {
        if self.try_acquire(n) {
            return true;
        }
        if !blocking || f64::from(n) > self.burst {
            return false;
        }
        let deadline = self.clock.now() + timeout;
        loop {
            let now = self.clock.now();
            if now >= deadline {
                tracing::debug!(tokens = n, "rate limiter wait timed out");
                return false;
            }
            thread::sleep(WAIT_STEP.min(deadline.saturating_duration_since(now)));
            if self.try_acquire(n) {
                return true;
            }
        }
    }
}
