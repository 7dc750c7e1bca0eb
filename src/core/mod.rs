//! Fault-tolerance primitives shared by the scheduler and the session runner.

pub mod breaker;
pub mod error;
pub mod events;
pub mod health;
pub mod rate_limiter;
pub mod registry;
pub mod resource_pool;
pub mod retry;

pub use breaker::{Breaker, BreakerConfig, BreakerError, BreakerState};
pub use error::{AppResult, SchedulerError};
pub use events::{
    build_event, EventSink, InMemoryEventSink, LifecycleEvent, SchedulerEvent, SharedEventSink, TracingEventSink,
};
pub use health::{CheckResult, HealthChecker, HealthProbe, HealthSnapshot};
pub use rate_limiter::RateLimiter;
pub use registry::{Cleanup, CleanupSummary, ResourceRegistry, SessionHandle, SessionRegistry};
pub use resource_pool::{Lease, PoolConfig, PoolError, PoolStats, PooledConnection, ResourcePool};
pub use retry::{classify, ErrorCategory, RetryAttempt, RetryClassifier, RetryError, RetryPolicy};
