//! Trigger computation, persistent state and the background scheduling loop.

pub mod job_scheduler;
pub mod state_store;
pub mod trigger;

pub use job_scheduler::{JobScheduler, SchedulerTimings};
pub use state_store::{SchedulerState, SchedulerStateStore, StateError};
pub use trigger::{next_run_time, trigger_window, within_window, TRIGGER_WINDOW_SECS};
