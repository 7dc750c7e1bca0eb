//! Registries of long-lived handles, held by non-owning references.
//!
//! Neither registry keeps its targets alive: entries are `Weak` and silently
//! drop out once the owner goes away. Cleanup is best effort; one failing
//! target never prevents the rest from running.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

/// Something that must be torn down before the process exits.
pub trait Cleanup: Send + Sync {
    /// Release external resources.
    ///
    /// # Errors
    ///
    /// Any failure is logged by the registry and otherwise ignored.
    fn cleanup(&self) -> anyhow::Result<()>;
}

/// Counts from a [`ResourceRegistry::cleanup_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Targets cleaned without error.
    pub cleaned: usize,
    /// Targets whose cleanup failed or panicked.
    pub failed: usize,
    /// Entries whose target had already been dropped.
    pub expired: usize,
}

struct Registered {
    name: String,
    target: Weak<dyn Cleanup>,
}

/// Process-exit cleanup list.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: Mutex<Vec<Registered>>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

static GLOBAL: OnceLock<ResourceRegistry> = OnceLock::new();

impl ResourceRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry. The CLI drains it before exiting.
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::new)
    }

    /// Track `target` without owning it.
    pub fn register<C: Cleanup + 'static>(&self, name: impl Into<String>, target: &Arc<C>) {
        let target: Weak<C> = Arc::downgrade(target);
        let target: Weak<dyn Cleanup> = target;
        let name = name.into();
        tracing::debug!(resource = %name, "registered for cleanup");
        self.entries.lock().push(Registered { name, target });
    }

    /// Stop tracking every entry named `name`.
    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        entries.len() != before
    }

    /// Names of entries whose targets are still alive.
    pub fn live_names(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.target.strong_count() > 0)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Drop entries whose targets are gone; returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.target.strong_count() > 0);
        before - entries.len()
    }

    /// Clean every live target once, newest first, and empty the registry.
    pub fn cleanup_all(&self) -> CleanupSummary {
        let entries: Vec<Registered> = std::mem::take(&mut *self.entries.lock());
        let mut summary = CleanupSummary::default();
        for entry in entries.into_iter().rev() {
            let Some(target) = entry.target.upgrade() else {
                summary.expired += 1;
                continue;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| target.cleanup())) {
                Ok(Ok(())) => {
                    tracing::debug!(resource = %entry.name, "cleaned up");
                    summary.cleaned += 1;
                }
                Ok(Err(e)) => {
                    tracing::warn!(resource = %entry.name, error = %e, "cleanup failed");
                    summary.failed += 1;
                }
                Err(_) => {
                    tracing::warn!(resource = %entry.name, "cleanup panicked");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

/// A long-lived external session, e.g. a driven browser.
pub trait SessionHandle: Send + Sync {
    /// Whether the session still responds.
    fn is_alive(&self) -> bool;
    /// Close the session.
    ///
    /// # Errors
    ///
    /// Failures are logged by the registry.
    fn close(&self) -> anyhow::Result<()>;
}

/// Named session handles, tracked weakly.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<String, Weak<dyn SessionHandle>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session under `name`, replacing any previous entry.
    pub fn register<H: SessionHandle + 'static>(&self, name: impl Into<String>, handle: &Arc<H>) {
        let handle: Weak<H> = Arc::downgrade(handle);
        let handle: Weak<dyn SessionHandle> = handle;
        self.sessions.write().insert(name.into(), handle);
    }

    /// Stop tracking `name`.
    pub fn remove(&self, name: &str) -> bool {
        self.sessions.write().remove(name).is_some()
    }

    /// The session named `name`, if its owner still holds it.
    pub fn get(&self, name: &str) -> Option<Arc<dyn SessionHandle>> {
        self.sessions.read().get(name).and_then(Weak::upgrade)
    }

    /// Names of sessions that are held and report alive.
    pub fn active(&self) -> Vec<String> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, weak)| weak.upgrade().is_some_and(|h| h.is_alive()))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Forget sessions that were dropped or no longer respond.
    pub fn prune(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, weak| weak.upgrade().is_some_and(|h| h.is_alive()));
        before - sessions.len()
    }

    /// Close every held session and empty the registry; returns sessions closed.
    pub fn close_all(&self) -> usize {
        let sessions = std::mem::take(&mut *self.sessions.write());
        let mut closed = 0;
        for (name, weak) in sessions {
            let Some(handle) = weak.upgrade() else {
                continue;
            };
            match handle.close() {
                Ok(()) => closed += 1,
                Err(e) => tracing::warn!(session = %name, error = %e, "failed to close session"),
            }
        }
        closed
    }
}

impl Cleanup for SessionRegistry {
    fn cleanup(&self) -> anyhow::Result<()> {
        let closed = self.close_all();
        tracing::info!(closed, "closed registered sessions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Cleanup for Counting {
        fn cleanup(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("file lock held");
            }
            Ok(())
        }
    }

    struct FakeSession {
        alive: AtomicBool,
        closed: AtomicBool,
    }

    impl FakeSession {
        fn new(alive: bool) -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(alive),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl SessionHandle for FakeSession {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_registry_does_not_keep_targets_alive() {
        let registry = ResourceRegistry::new();
        let target = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        registry.register("pool", &target);
        assert_eq!(registry.live_names(), vec!["pool".to_string()]);
        drop(target);
        assert!(registry.live_names().is_empty());
        assert_eq!(registry.prune(), 1);
    }

    #[test]
    fn test_cleanup_all_continues_past_failures() {
        let registry = ResourceRegistry::new();
        let ok = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let failing = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let gone = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        registry.register("ok", &ok);
        registry.register("failing", &failing);
        registry.register("gone", &gone);
        drop(gone);

        let summary = registry.cleanup_all();
        assert_eq!(
            summary,
            CleanupSummary {
                cleaned: 1,
                failed: 1,
                expired: 1
            }
        );
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);

        // Entries are consumed by the pass.
        assert_eq!(registry.cleanup_all(), CleanupSummary::default());
    }

    #[test]
    fn test_session_registry_tracks_alive_sessions() {
        let registry = SessionRegistry::new();
        let alive = FakeSession::new(true);
        let dead = FakeSession::new(false);
        registry.register("browser", &alive);
        registry.register("stale", &dead);

        assert_eq!(registry.active(), vec!["browser".to_string()]);
        assert!(registry.get("browser").is_some());
        assert_eq!(registry.prune(), 1);
        assert!(registry.get("stale").is_none());

        assert_eq!(registry.close_all(), 1);
        assert!(alive.closed.load(Ordering::SeqCst));
        assert!(registry.get("browser").is_none());
    }
}
