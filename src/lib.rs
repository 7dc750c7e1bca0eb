//! # Session Scheduler
//!
//! Fault-tolerant scheduling and resource orchestration for long-running,
//! unattended automation sessions.
//!
//! A session drives an external task (typically a browser automation bot)
//! that can hang, crash or lose its dependency at any point. This crate wraps
//! such a task so every session ends with a persisted report, no matter how
//! the task misbehaves.
//!
//! ## Building Blocks
//!
//! - **Breaker**: circuit breaker that stops calling a failing dependency
//! - **RetryPolicy**: error classification plus exponential back-off with jitter
//! - **RateLimiter**: token bucket for outgoing traffic
//! - **HealthChecker**: named health probes
//! - **ResourcePool**: bounded pool of expensive handles with validation and eviction
//! - **ResourceRegistry / SessionRegistry**: weak registries for process-exit cleanup
//!
//! ## Sessions
//!
//! [`session::SessionRunner`] runs one session end to end: it applies safety
//! overrides to the task settings, starts a [`session::SessionWatchdog`],
//! launches the task on its own thread, enforces the runtime budget,
//! reconciles counters against the CSV ledgers and writes the report.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use session_scheduler::config::ConfigSource;
//! use session_scheduler::infra::{CommandLauncher, LedgerSet};
//! use session_scheduler::scheduler::{JobScheduler, SchedulerStateStore};
//! use session_scheduler::session::SessionRunner;
//!
//! let config = ConfigSource::File("scheduler_config.json".into());
//! let store = SchedulerStateStore::new("scheduler_state.json");
//! let runner = SessionRunner::new(
//!     config.clone(),
//!     Arc::new(CommandLauncher::new("./bot", "work")),
//!     LedgerSet::in_dir("ledger"),
//!     store.clone(),
//! );
//!
//! let scheduler = JobScheduler::new(config, Arc::new(runner), store);
//! scheduler.start()?;
//! // ...
//! scheduler.stop();
//! ```
//!
//! ## Scheduling
//!
//! [`scheduler::JobScheduler`] polls on a background thread, computes
//! interval, daily or weekly triggers, enforces the daily allowance and
//! persists its bookkeeping through [`scheduler::SchedulerStateStore`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders for pools and schedulers.
pub mod builders;
/// Configuration models for schedules, notifications and task overrides.
pub mod config;
/// Fault-tolerance primitives.
pub mod core;
/// Ledgers, notifications, probes and the child-process task.
pub mod infra;
/// Trigger computation, persistent state and the scheduling loop.
pub mod scheduler;
/// Session context, watchdog and runner.
pub mod session;
/// Shared utilities.
pub mod util;
