//! Configuration models for schedules, notifications and task overrides.

pub mod schedule;
pub mod source;
pub mod task;

pub use schedule::{parse_hhmm, ConfigError, NotificationMethod, ScheduleType, SchedulerConfig};
pub use source::ConfigSource;
pub use task::{ResumeMode, TaskOverrides, TaskSettings};
