//! The contract between the runner and the long-running task it drives.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TaskSettings;
use crate::session::SessionContext;

/// Per-session outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskCounters {
    /// Applications submitted in place.
    pub applied: u32,
    /// Applications completed on an external site.
    pub external: u32,
    /// Attempts that failed.
    pub failed: u32,
    /// Candidates skipped.
    pub skipped: u32,
}

impl TaskCounters {
    /// Applied plus external.
    #[must_use]
    pub const fn successful(&self) -> u32 {
        self.applied.saturating_add(self.external)
    }
}

/// Failures surfaced by a task or its launcher.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The external dependency (e.g. the browser) went away mid-session.
    #[error("dependency connection lost: {0}")]
    ConnectionLost(String),
    /// The task could not be located or prepared.
    #[error("task setup failed: {0}")]
    Setup(String),
    /// The task failed while running.
    #[error("{0}")]
    Failed(String),
    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A long-running unit of work driven for one session.
///
/// `run` executes on a dedicated thread inside a current-thread runtime, so
/// implementations may block. They should check
/// [`SessionContext::stop_requested`] between units of work.
#[async_trait]
pub trait SessionTask: Send + Sync + 'static {
    /// Run until done, stopped, or failed.
    async fn run(&self, ctx: Arc<SessionContext>) -> Result<(), TaskError>;

    /// Ask the task to stop at its next safe point.
    ///
    /// Called in addition to setting the context stop flag; the default does
    /// nothing.
    fn request_stop(&self) {}

    /// Counters to report once the session ends.
    fn counters(&self, ctx: &SessionContext) -> TaskCounters {
        ctx.counters()
    }
}

/// Locates and prepares the task for each session.
pub trait TaskLauncher: Send + Sync {
    /// Settings the task would use without any session overrides.
    ///
    /// # Errors
    ///
    /// The task or its settings cannot be found.
    fn base_settings(&self) -> Result<TaskSettings, TaskError>;

    /// Build a task bound to `settings`.
    ///
    /// # Errors
    ///
    /// The task cannot be prepared with these settings.
    fn prepare(&self, settings: TaskSettings) -> Result<Arc<dyn SessionTask>, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_sums_applied_and_external() {
        let counters = TaskCounters {
            applied: 3,
            external: 2,
            failed: 7,
            skipped: 1,
        };
        assert_eq!(counters.successful(), 5);
    }

    #[test]
    fn test_counters_parse_partial_json() {
        let counters: TaskCounters = serde_json::from_str(r#"{"applied": 4}"#).unwrap();
        assert_eq!(counters.applied, 4);
        assert_eq!(counters.failed, 0);
    }
}
