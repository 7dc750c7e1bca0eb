//! Error classification and bounded exponential-backoff retry.
//!
//! Errors are sorted into three categories by substring markers. Only the
//! categories listed in a [`RetryPolicy`] are retried; everything else is
//! returned on the first failure.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad class of a failure, deciding whether it is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network blips, timeouts, rate limiting, stale handles.
    Transient,
    /// Bad input, bad configuration, authorization failures.
    Deterministic,
    /// Crashed dependency, memory exhaustion, file locks.
    Resource,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Deterministic => write!(f, "deterministic"),
            Self::Resource => write!(f, "resource"),
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "reset by peer",
    "broken pipe",
    "rate limit",
    "too many requests",
    "429",
    "503",
    "temporarily",
    "try again",
    "stale element",
    "network",
];

const DETERMINISTIC_MARKERS: &[&str] = &[
    "invalid",
    "unauthorized",
    "forbidden",
    "401",
    "403",
    "authentication",
    "permission denied",
    "validation",
    "bad request",
    "malformed",
    "not supported",
];

const RESOURCE_MARKERS: &[&str] = &[
    "crashed",
    "out of memory",
    "oom-kill",
    "oom killer",
    "file lock",
    "locked",
    "resource busy",
    "no space left",
    "too many open files",
    "not reachable",
    "session deleted",
];

/// Substring classifier over three disjoint marker sets.
///
/// Deterministic markers are checked first, then resource, then transient;
/// anything unmatched is treated as transient.
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    transient: Vec<String>,
    deterministic: Vec<String>,
    resource: Vec<String>,
}

impl Default for RetryClassifier {
    fn default() -> Self {
        let owned = |markers: &[&str]| markers.iter().map(|m| (*m).to_string()).collect();
        Self {
            transient: owned(TRANSIENT_MARKERS),
            deterministic: owned(DETERMINISTIC_MARKERS),
            resource: owned(RESOURCE_MARKERS),
        }
    }
}

impl RetryClassifier {
    /// Add an extra (lower-case) marker for `category`.
    #[must_use]
    pub fn with_marker(mut self, category: ErrorCategory, marker: impl Into<String>) -> Self {
        let marker = marker.into().to_lowercase();
        match category {
            ErrorCategory::Transient => self.transient.push(marker),
            ErrorCategory::Deterministic => self.deterministic.push(marker),
            ErrorCategory::Resource => self.resource.push(marker),
        }
        self
    }

    /// Classify an error by its rendered message.
    pub fn classify<E: fmt::Display + ?Sized>(&self, error: &E) -> ErrorCategory {
        let message = error.to_string().to_lowercase();
        let hit = |markers: &[String]| markers.iter().any(|m| message.contains(m.as_str()));
        if hit(&self.deterministic) {
            ErrorCategory::Deterministic
        } else if hit(&self.resource) {
            ErrorCategory::Resource
        } else {
            ErrorCategory::Transient
        }
    }
}

/// Classify with the default marker sets.
pub fn classify<E: fmt::Display + ?Sized>(error: &E) -> ErrorCategory {
    RetryClassifier::default().classify(error)
}

/// Details passed to the retry-observed hook before each back-off sleep.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// Attempt that just failed (1-based).
    pub attempt: u32,
    /// Sleep before the next attempt, jitter included.
    pub delay: Duration,
    /// Category of the failure.
    pub category: ErrorCategory,
    /// Rendered failure.
    pub error: String,
}

type RetryHook = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// Bounded exponential back-off policy.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap on the un-jittered delay.
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter_fraction: f64,
    /// Categories eligible for retry.
    pub retryable: HashSet<ErrorCategory>,
    classifier: RetryClassifier,
    on_retry: Option<RetryHook>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("retryable", &self.retryable)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.1,
            retryable: HashSet::from([ErrorCategory::Transient]),
            classifier: RetryClassifier::default(),
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt budget and default delays.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Set base and maximum delay.
    #[must_use]
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter fraction (clamped to `0.0..=1.0`).
    #[must_use]
    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction.clamp(0.0, 1.0);
        self
    }

    /// Replace the set of retryable categories.
    #[must_use]
    pub fn retrying(mut self, categories: impl IntoIterator<Item = ErrorCategory>) -> Self {
        self.retryable = categories.into_iter().collect();
        self
    }

    /// Use a custom classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Observe each retry before its back-off sleep.
    #[must_use]
    pub fn on_retry(mut self, hook: impl Fn(&RetryAttempt) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_fraction <= 0.0 {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter_fraction);
        delay.mul_f64(1.0 + extra)
    }

    /// Run `op`, retrying retryable failures with back-off.
    ///
    /// `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// [`RetryError::NotRetryable`] on the first failure whose category is not
    /// retryable, [`RetryError::Exhausted`] once `max_attempts` have failed.
    pub fn run<T, E, F>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            let error = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let category = self.classifier.classify(&error);
            if !self.retryable.contains(&category) {
                tracing::debug!(%category, %error, attempt, "error not retryable");
                return Err(RetryError::NotRetryable { category, error });
            }
            if attempt >= self.max_attempts {
                tracing::warn!(%error, attempts = attempt, "retry attempts exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }
            let delay = self.jittered(self.backoff_delay(attempt));
            tracing::info!(
                %category,
                %error,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "retrying after failure"
            );
            if let Some(hook) = &self.on_retry {
                hook(&RetryAttempt {
                    attempt,
                    delay,
                    category,
                    error: error.to_string(),
                });
            }
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The error's category is not retryable; returned without retrying.
    #[error("{category} error: {error}")]
    NotRetryable {
        /// Category assigned by the classifier.
        category: ErrorCategory,
        /// The original error.
        error: E,
    },
    /// Every attempt failed.
    #[error("retry exhausted after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Final error.
        last: E,
    },
}

impl<E> RetryError<E> {
    /// The underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::NotRetryable { error, .. } => error,
            Self::Exhausted { last, .. } => last,
        }
    }
}
