//! Error types for scheduler operations.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::{BreakerError, PoolError, RetryError};
use crate::scheduler::StateError;

/// Errors produced by scheduler components.
///
/// Library-level conditions (open breaker, exhausted pool, exhausted retries)
/// are distinct variants so callers must handle them explicitly.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A circuit breaker refused the call.
    #[error("circuit breaker open: {0}")]
    BreakerOpen(String),
    /// No pooled resource became available in time.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// A retried operation ran out of attempts.
    #[error("retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Rendering of the final error.
        last: String,
    },
    /// Durable state could not be read or written.
    #[error(transparent)]
    State(#[from] StateError),
    /// Configuration was missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

impl<E: fmt::Display> From<BreakerError<E>> for SchedulerError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open { name } => Self::BreakerOpen(name),
            BreakerError::Inner(e) => Self::Backend(e.to_string()),
        }
    }
}

impl<E: fmt::Display> From<RetryError<E>> for SchedulerError {
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => Self::RetryExhausted {
                attempts,
                last: last.to_string(),
            },
            RetryError::NotRetryable { category, error } => Self::Backend(format!("{category} error: {error}")),
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_conditions_keep_their_variant() {
        let open: SchedulerError = BreakerError::<std::io::Error>::Open {
            name: "ledger".into(),
        }
        .into();
        assert!(matches!(open, SchedulerError::BreakerOpen(ref name) if name == "ledger"));

        let exhausted: SchedulerError = RetryError::Exhausted {
            attempts: 3,
            last: "timed out",
        }
        .into();
        assert_eq!(exhausted.to_string(), "retry exhausted after 3 attempts: timed out");
    }
}
