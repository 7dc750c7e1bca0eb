//! Builder for [`JobScheduler`]s.

use std::sync::Arc;

use crate::config::ConfigSource;
use crate::core::{SharedEventSink, TracingEventSink};
use crate::infra::NotificationDispatcher;
use crate::scheduler::{JobScheduler, SchedulerStateStore, SchedulerTimings};
use crate::session::SessionDriver;
use crate::util::clock::{SharedClock, SystemClock};

/// Fluent construction of a [`JobScheduler`].
///
/// ```rust,ignore
/// let scheduler = JobSchedulerBuilder::new(config, runner, store)
///     .events(Arc::new(InMemoryEventSink::new(256)))
///     .timings(SchedulerTimings { poll_interval: Duration::from_secs(5), ..Default::default() })
///     .build();
/// ```
pub struct JobSchedulerBuilder {
    config: ConfigSource,
    driver: Arc<dyn SessionDriver>,
    store: SchedulerStateStore,
    clock: SharedClock,
    events: SharedEventSink,
    notifier: Arc<NotificationDispatcher>,
    timings: SchedulerTimings,
}

impl JobSchedulerBuilder {
    /// Start with the system clock, tracing events and default timings.
    pub fn new(config: ConfigSource, driver: Arc<dyn SessionDriver>, store: SchedulerStateStore) -> Self {
        Self {
            config,
            driver,
            store,
            clock: SystemClock::shared(),
            events: Arc::new(TracingEventSink),
            notifier: Arc::new(NotificationDispatcher::new()),
            timings: SchedulerTimings::default(),
        }
    }

    /// Clock for triggers and day boundaries.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Lifecycle event sink.
    #[must_use]
    pub fn events(mut self, events: SharedEventSink) -> Self {
        self.events = events;
        self
    }

    /// Notification dispatcher, usually shared with the runner.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<NotificationDispatcher>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Loop timings.
    #[must_use]
    pub fn timings(mut self, timings: SchedulerTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Build the scheduler, loading persisted state.
    #[must_use]
    pub fn build(self) -> JobScheduler {
        JobScheduler::assemble(
            self.config,
            self.driver,
            self.store,
            self.clock,
            self.events,
            self.notifier,
            self.timings,
        )
    }
}
