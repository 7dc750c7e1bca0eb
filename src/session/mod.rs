//! Session execution: the task contract, per-session context, watchdog,
//! counter reconciliation and the runner that ties them together.

pub mod context;
pub mod reconcile;
pub mod report;
pub mod runner;
pub mod task;
pub mod watchdog;

pub use context::{legacy_keys, LegacyNamespace, SessionContext, StopSignal};
pub use reconcile::{reconcile_successes, Reconciliation};
pub use report::{push_bounded, ExitReason, SessionReport, MAX_REPORT_ERRORS};
pub use runner::{RunnerTimings, SessionDriver, SessionRunner};
pub use task::{SessionTask, TaskCounters, TaskError, TaskLauncher};
pub use watchdog::{AlwaysAlive, LivenessProbe, SessionWatchdog, StopCallback, WatchdogConfig};
