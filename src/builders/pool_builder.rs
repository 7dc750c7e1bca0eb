//! Builder for [`ResourcePool`]s.

use std::sync::Arc;
use std::time::Duration;

use crate::core::resource_pool::{PoolConfig, PoolError, ResourcePool};
use crate::util::clock::{SharedClock, SystemClock};

/// Fluent construction of a [`ResourcePool`].
///
/// ```rust,ignore
/// let pool = ResourcePoolBuilder::new(|| BrowserSession::connect(&url))
///     .max_size(2)
///     .max_idle_time(Duration::from_secs(300))
///     .validator(|session| session.is_responsive())
///     .destroyer(|session| session.close())
///     .build("browser")?;
/// ```
pub struct ResourcePoolBuilder<T> {
    config: PoolConfig<T>,
    clock: SharedClock,
}

impl<T: Send + 'static> ResourcePoolBuilder<T> {
    /// Start from a factory with `max_size` 4, no eviction, 30s acquire timeout.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            config: PoolConfig {
                factory: Arc::new(factory),
                destroyer: None,
                validator: None,
                min_size: 0,
                max_size: 4,
                max_idle_time: None,
                max_age: None,
                acquire_timeout: Duration::from_secs(30),
            },
            clock: SystemClock::shared(),
        }
    }

    /// Disposal hook for handles leaving the pool.
    #[must_use]
    pub fn destroyer<F>(mut self, destroyer: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.config.destroyer = Some(Arc::new(destroyer));
        self
    }

    /// Validity check run before a pooled handle is handed out.
    #[must_use]
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.config.validator = Some(Arc::new(validator));
        self
    }

    /// Leases pre-created at construction.
    #[must_use]
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.config.min_size = min_size;
        self
    }

    /// Maximum live leases.
    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.config.max_size = max_size;
        self
    }

    /// Discard leases idle longer than this.
    #[must_use]
    pub fn max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.config.max_idle_time = Some(max_idle_time);
        self
    }

    /// Discard leases older than this.
    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.config.max_age = Some(max_age);
        self
    }

    /// Default wait for [`ResourcePool::connection`].
    #[must_use]
    pub fn acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.config.acquire_timeout = acquire_timeout;
        self
    }

    /// Time source for lease aging.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Build the pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] when sizes are inconsistent.
    pub fn build(self, name: impl Into<String>) -> Result<ResourcePool<T>, PoolError> {
        ResourcePool::new(name, self.config, self.clock)
    }
}
