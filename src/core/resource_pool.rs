//! Lease pool for scarce external handles.
//!
//! Handles (a browser session, an API client) are created on demand by a
//! factory up to `max_size`, handed out exclusively as [`Lease`]s and
//! recycled on release. A lease older than `max_age`, idle longer than
//! `max_idle_time`, or rejected by the validator is destroyed and never handed
//! out.
//!
//! Uses a `parking_lot::Mutex` for pool state and a `parking_lot::Condvar` to
//! wake waiters when a lease is released.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::core::registry::{Cleanup, ResourceRegistry};
use crate::util::clock::SharedClock;

/// Pause between attempts after the factory fails.
const CREATE_BACKOFF: Duration = Duration::from_millis(50);

/// Errors produced by a [`ResourcePool`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// No lease became available before the timeout.
    #[error("resource pool exhausted: no lease within {timeout:?} (max_size {max_size})")]
    Exhausted {
        /// How long the caller waited.
        timeout: Duration,
        /// Pool capacity.
        max_size: usize,
    },
    /// The pool has been shut down.
    #[error("resource pool has been shut down")]
    Shutdown,
    /// Configuration validation failed.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Creates a new handle.
pub type Factory<T> = Arc<dyn Fn() -> anyhow::Result<T> + Send + Sync>;
/// Disposes of a handle that leaves the pool.
pub type Destroyer<T> = Arc<dyn Fn(T) + Send + Sync>;
/// Reports whether a pooled handle is still usable.
pub type Validator<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Pool configuration. Usually assembled with
/// [`ResourcePoolBuilder`](crate::builders::ResourcePoolBuilder).
pub struct PoolConfig<T> {
    /// Handle factory.
    pub factory: Factory<T>,
    /// Optional disposal hook; handles are simply dropped without one.
    pub destroyer: Option<Destroyer<T>>,
    /// Optional validity check run before a lease is handed out.
    pub validator: Option<Validator<T>>,
    /// Leases created eagerly at construction.
    pub min_size: usize,
    /// Upper bound on live leases (idle plus in use).
    pub max_size: usize,
    /// Idle time after which a lease is discarded.
    pub max_idle_time: Option<Duration>,
    /// Age after which a lease is discarded.
    pub max_age: Option<Duration>,
    /// Default wait used by [`ResourcePool::connection`].
    pub acquire_timeout: Duration,
}

impl<T> PoolConfig<T> {
    /// Validate sizes.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be greater than 0".into());
        }
        if self.min_size > self.max_size {
            return Err(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            ));
        }
        Ok(())
    }
}

/// A pooled handle, exclusively owned by whoever holds it.
pub struct Lease<T> {
    handle: T,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
}

impl<T> Lease<T> {
    fn new(handle: T, now: Instant) -> Self {
        Self {
            handle,
            created_at: now,
            last_used_at: now,
            use_count: 0,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_used_at = now;
        self.use_count += 1;
    }

    /// Time since the handle was created.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time since the handle was last handed out or returned.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    /// Times the handle has been handed out.
    #[must_use]
    pub const fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Borrow the handle.
    #[must_use]
    pub const fn handle(&self) -> &T {
        &self.handle
    }

    /// Take the handle out of the pool's bookkeeping. The slot stays counted
    /// until [`ResourcePool::forget`] is called.
    pub fn into_inner(self) -> T {
        self.handle
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.handle
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.handle
    }
}

impl<T> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("use_count", &self.use_count)
            .finish_non_exhaustive()
    }
}

/// Pool utilization counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Leases waiting in the pool.
    pub idle: usize,
    /// Leases currently held by callers.
    pub in_use: usize,
    /// Live leases (idle plus in use).
    pub total: usize,
    /// Capacity.
    pub max_size: usize,
    /// Handles created over the pool's lifetime.
    pub created: u64,
    /// Handles destroyed over the pool's lifetime.
    pub destroyed: u64,
}

struct PoolState<T> {
    idle: VecDeque<Lease<T>>,
    total: usize,
    shutdown: bool,
    created: u64,
    destroyed: u64,
}

/// Generic lease pool.
pub struct ResourcePool<T> {
    name: String,
    config: PoolConfig<T>,
    clock: SharedClock,
    state: Mutex<PoolState<T>>,
    /// Signalled when a lease is returned or a slot frees up.
    available: Condvar,
}

impl<T: Send + 'static> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    /// Create a pool and pre-create `min_size` leases (best effort).
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] when sizes are inconsistent.
    pub fn new(name: impl Into<String>, config: PoolConfig<T>, clock: SharedClock) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        let pool = Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                shutdown: false,
                created: 0,
                destroyed: 0,
            }),
            available: Condvar::new(),
        };
        pool.prewarm();
        tracing::info!(
            pool = %pool.name,
            min_size = pool.config.min_size,
            max_size = pool.config.max_size,
            "resource pool initialized"
        );
        Ok(pool)
    }

    fn prewarm(&self) {
        for _ in 0..self.config.min_size {
            match (self.config.factory)() {
                Ok(handle) => {
                    let mut state = self.state.lock();
                    state.total += 1;
                    state.created += 1;
                    state.idle.push_back(Lease::new(handle, self.clock.now()));
                }
                Err(e) => {
                    tracing::warn!(pool = %self.name, error = %e, "failed to pre-create lease");
                    break;
                }
            }
        }
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live leases, idle plus in use. Never exceeds `max_size`.
    pub fn size(&self) -> usize {
        self.state.lock().total
    }

    /// Utilization snapshot.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.total - state.idle.len(),
            total: state.total,
            max_size: self.config.max_size,
            created: state.created,
            destroyed: state.destroyed,
        }
    }

    fn expiry_reason(&self, lease: &Lease<T>) -> Option<&'static str> {
        let now = self.clock.now();
        if self.config.max_age.is_some_and(|max| lease.age(now) > max) {
            return Some("max_age");
        }
        if self.config.max_idle_time.is_some_and(|max| lease.idle_for(now) > max) {
            return Some("max_idle_time");
        }
        None
    }

    fn destroy(&self, handle: T) {
        if let Some(destroyer) = &self.config.destroyer {
            destroyer(handle);
        }
    }

    /// Wait up to `timeout` for a valid lease.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`] on timeout, [`PoolError::Shutdown`] once the
    /// pool is shut down.
    pub fn acquire(&self, timeout: Duration) -> Result<Lease<T>, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Err(PoolError::Shutdown);
            }

            if let Some(mut lease) = state.idle.pop_back() {
                let reason = self.expiry_reason(&lease).or_else(|| {
                    let valid = self.config.validator.as_ref().is_none_or(|validate| {
                        MutexGuard::unlocked(&mut state, || validate(&lease.handle))
                    });
                    (!valid).then_some("validator")
                });
                if let Some(reason) = reason {
                    state.total -= 1;
                    state.destroyed += 1;
                    tracing::debug!(pool = %self.name, reason, "discarding pooled lease");
                    MutexGuard::unlocked(&mut state, || self.destroy(lease.handle));
                    self.available.notify_one();
                    continue;
                }
                lease.touch(self.clock.now());
                return Ok(lease);
            }

            if state.total < self.config.max_size {
                state.total += 1;
                let created = MutexGuard::unlocked(&mut state, || (self.config.factory)());
                match created {
                    Ok(handle) => {
                        state.created += 1;
                        let mut lease = Lease::new(handle, self.clock.now());
                        lease.touch(self.clock.now());
                        tracing::debug!(pool = %self.name, total = state.total, "created lease");
                        return Ok(lease);
                    }
                    Err(e) => {
                        state.total -= 1;
                        tracing::warn!(pool = %self.name, error = %e, "lease factory failed");
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Err(self.exhausted(timeout));
                        }
                        MutexGuard::unlocked(&mut state, || {
                            thread::sleep(CREATE_BACKOFF.min(remaining));
                        });
                        continue;
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(self.exhausted(timeout));
            }
            // Spurious and timed-out wakeups both re-run the loop; the
            // deadline check above ends it.
            let _ = self.available.wait_until(&mut state, deadline);
        }
    }

    fn exhausted(&self, timeout: Duration) -> PoolError {
        tracing::warn!(pool = %self.name, ?timeout, "resource pool exhausted");
        PoolError::Exhausted {
            timeout,
            max_size: self.config.max_size,
        }
    }

    /// Return a lease. Destroyed instead when the pool is full or shut down.
    pub fn release(&self, mut lease: Lease<T>) {
        let mut state = self.state.lock();
        if state.shutdown || state.idle.len() >= self.config.max_size {
            state.total = state.total.saturating_sub(1);
            state.destroyed += 1;
            drop(state);
            self.destroy(lease.handle);
            self.available.notify_one();
            return;
        }
        lease.last_used_at = self.clock.now();
        state.idle.push_back(lease);
        drop(state);
        self.available.notify_one();
    }

    /// Destroy a lease the caller found broken, freeing its slot.
    pub fn discard(&self, lease: Lease<T>) {
        {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
            state.destroyed += 1;
        }
        self.destroy(lease.handle);
        self.available.notify_one();
    }

    /// Free the slot of a lease taken out with [`Lease::into_inner`].
    pub fn forget(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    /// Scoped acquisition using the configured `acquire_timeout`. The lease
    /// goes back to the pool when the guard drops, including during unwinding.
    ///
    /// # Errors
    ///
    /// Same as [`ResourcePool::acquire`].
    pub fn connection(&self) -> Result<PooledConnection<'_, T>, PoolError> {
        let lease = self.acquire(self.config.acquire_timeout)?;
        Ok(PooledConnection {
            pool: self,
            lease: Some(lease),
        })
    }

    /// Drain and destroy every idle lease. Idempotent; leases still out are
    /// destroyed when released.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Lease<T>> = {
            let mut state = self.state.lock();
            if !state.shutdown {
                tracing::info!(pool = %self.name, "shutting down resource pool");
            }
            state.shutdown = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total -= drained.len();
            state.destroyed += drained.len() as u64;
            drained
        };
        let count = drained.len();
        for lease in drained {
            self.destroy(lease.handle);
        }
        self.available.notify_all();
        count
    }

    /// Whether [`ResourcePool::shutdown`] has run.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Register this pool with the process-wide registry so
    /// [`ResourceRegistry::cleanup_all`] shuts it down at exit.
    pub fn register_for_exit(self: &Arc<Self>) {
        ResourceRegistry::global().register(self.name.clone(), self);
    }
}

impl<T: Send + 'static> Cleanup for ResourcePool<T> {
    fn cleanup(&self) -> anyhow::Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl<T> Drop for ResourcePool<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.shutdown = true;
        let drained: Vec<Lease<T>> = state.idle.drain(..).collect();
        for lease in drained {
            if let Some(destroyer) = &self.config.destroyer {
                destroyer(lease.handle);
            }
        }
    }
}

/// Scoped lease returned by [`ResourcePool::connection`].
pub struct PooledConnection<'a, T: Send + 'static> {
    pool: &'a ResourcePool<T>,
    lease: Option<Lease<T>>,
}

impl<T: Send + 'static> PooledConnection<'_, T> {
    /// Destroy the handle instead of returning it to the pool.
    pub fn discard(mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.discard(lease);
        }
    }
}

impl<T: Send + 'static> Deref for PooledConnection<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `discard`/`drop` take the lease, and both consume the guard.
        self.lease.as_ref().map(Lease::handle).unwrap_or_else(|| unreachable!())
    }
}

impl<T: Send + 'static> DerefMut for PooledConnection<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.lease.as_mut().map(|l| &mut l.handle).unwrap_or_else(|| unreachable!())
    }
}

impl<T: Send + 'static> Drop for PooledConnection<'_, T> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.release(lease);
        }
    }
}
