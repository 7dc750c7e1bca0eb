//! Named health-check registry with an aggregate snapshot.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Zero-argument probe; `Ok(true)` is healthy, anything else is not.
pub type HealthProbe = Arc<dyn Fn() -> anyhow::Result<bool> + Send + Sync>;

/// Last observed result of one check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    /// Whether the probe reported healthy.
    pub healthy: bool,
    /// When the probe last ran.
    pub checked_at: DateTime<Utc>,
    /// Error or panic message when the probe failed.
    pub error: Option<String>,
}

/// Aggregate health view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Conjunction of every check.
    pub ok: bool,
    /// Per-check results, by name.
    pub checks: BTreeMap<String, CheckResult>,
}

#[derive(Default)]
struct Entry {
    probe: Option<HealthProbe>,
    last: Option<CheckResult>,
}

/// Registry mapping names to probes.
#[derive(Default)]
pub struct HealthChecker {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("checks", &self.entries.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HealthChecker {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a probe.
    pub fn register<F>(&self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.entries.write().insert(
            name.into(),
            Entry {
                probe: Some(Arc::new(probe)),
                last: None,
            },
        );
    }

    /// Remove a probe.
    pub fn unregister(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    /// Registered check names.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Run one probe. Unknown names are unhealthy.
    pub fn check(&self, name: &str) -> bool {
        let probe = self.entries.read().get(name).and_then(|e| e.probe.clone());
        let Some(probe) = probe else {
            tracing::warn!(check = name, "unknown health check");
            return false;
        };

        let result = match panic::catch_unwind(AssertUnwindSafe(|| probe())) {
            Ok(Ok(healthy)) => CheckResult {
                healthy,
                checked_at: Utc::now(),
                error: None,
            },
            Ok(Err(e)) => CheckResult {
                healthy: false,
                checked_at: Utc::now(),
                error: Some(e.to_string()),
            },
            Err(_) => CheckResult {
                healthy: false,
                checked_at: Utc::now(),
                error: Some("probe panicked".into()),
            },
        };
        if !result.healthy {
            tracing::debug!(check = name, error = ?result.error, "health check failed");
        }
        let healthy = result.healthy;
        if let Some(entry) = self.entries.write().get_mut(name) {
            entry.last = Some(result);
        }
        healthy
    }

    /// Run every probe and return per-name results.
    pub fn check_all(&self) -> BTreeMap<String, bool> {
        self.names()
            .into_iter()
            .map(|name| {
                let healthy = self.check(&name);
                (name, healthy)
            })
            .collect()
    }

    /// Run every probe; true only if all are healthy.
    pub fn is_healthy(&self) -> bool {
        self.check_all().values().all(|healthy| *healthy)
    }

    /// Last recorded result for `name`.
    pub fn last_result(&self, name: &str) -> Option<CheckResult> {
        self.entries.read().get(name).and_then(|e| e.last.clone())
    }

    /// Snapshot of recorded results without re-running probes.
    pub fn snapshot(&self) -> HealthSnapshot {
        let entries = self.entries.read();
        let checks: BTreeMap<String, CheckResult> = entries
            .iter()
            .filter_map(|(name, e)| e.last.clone().map(|r| (name.clone(), r)))
            .collect();
        let ok = checks.len() == entries.len() && checks.values().all(|r| r.healthy);
        HealthSnapshot { ok, checks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_healthy() {
        let checker = HealthChecker::new();
        checker.register("db", || Ok(true));
        checker.register("browser", || Ok(true));
        assert!(checker.is_healthy());
        assert!(checker.snapshot().ok);
    }

    #[test]
    fn test_errors_and_panics_are_unhealthy() {
        let checker = HealthChecker::new();
        checker.register("erroring", || Err(anyhow::anyhow!("socket closed")));
        checker.register("panicking", || panic!("probe bug"));
        checker.register("fine", || Ok(true));

        let results = checker.check_all();
        assert_eq!(results.get("erroring"), Some(&false));
        assert_eq!(results.get("panicking"), Some(&false));
        assert_eq!(results.get("fine"), Some(&true));
        assert!(!checker.is_healthy());

        let last = checker.last_result("erroring").unwrap();
        assert_eq!(last.error.as_deref(), Some("socket closed"));
    }

    #[test]
    fn test_snapshot_before_any_check_is_not_ok() {
        let checker = HealthChecker::new();
        checker.register("db", || Ok(true));
        assert!(!checker.snapshot().ok);
        checker.check("db");
        assert!(checker.snapshot().ok);
    }

    #[test]
    fn test_unknown_check_unhealthy() {
        let checker = HealthChecker::new();
        assert!(!checker.check("missing"));
        assert!(checker.is_healthy());
    }
}
