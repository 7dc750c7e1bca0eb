//! Per-session state shared between the runner and the task.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::session::TaskCounters;

/// Flat key/value namespace used by tasks that predate [`SessionContext`].
pub type LegacyNamespace = Map<String, Value>;

/// Legacy key names.
pub mod legacy_keys {
    /// Applications submitted in place.
    pub const APPLIED: &str = "applied_count";
    /// External applications.
    pub const EXTERNAL: &str = "external_count";
    /// Failed attempts.
    pub const FAILED: &str = "failed_count";
    /// Skipped candidates.
    pub const SKIPPED: &str = "skipped_count";
    /// Pause before submitting each application.
    pub const PAUSE_BEFORE_SUBMIT: &str = "pause_before_submit";
    /// Pause when a question cannot be answered.
    pub const PAUSE_AT_FAILED_QUESTION: &str = "pause_at_failed_question";
    /// Set once the daily limit has been hit.
    pub const DAILY_LIMIT_REACHED: &str = "daily_limit_reached";
}

/// Cloneable handle to a session's stop flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Raise the flag. Idempotent.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag is raised.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters and flags for one session.
///
/// Every field is atomic so the runner, the watchdog and the task thread can
/// share one `Arc<SessionContext>` without locking.
#[derive(Debug)]
pub struct SessionContext {
    session_id: String,
    created_at: DateTime<Utc>,
    applied: AtomicU32,
    external: AtomicU32,
    failed: AtomicU32,
    skipped: AtomicU32,
    pause_before_submit: AtomicBool,
    pause_at_failed_question: AtomicBool,
    daily_limit_reached: AtomicBool,
    stop: StopSignal,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

impl SessionContext {
    /// Fresh context with zeroed counters.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: Utc::now(),
            applied: AtomicU32::new(0),
            external: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            skipped: AtomicU32::new(0),
            pause_before_submit: AtomicBool::new(false),
            pause_at_failed_question: AtomicBool::new(false),
            daily_limit_reached: AtomicBool::new(false),
            stop: StopSignal::default(),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Count one in-place application.
    pub fn record_applied(&self) -> u32 {
        self.applied.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count one external application.
    pub fn record_external(&self) -> u32 {
        self.external.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count one failure.
    pub fn record_failed(&self) -> u32 {
        self.failed.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count one skip.
    pub fn record_skipped(&self) -> u32 {
        self.skipped.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Overwrite all counters, e.g. from a progress report.
    pub fn set_counters(&self, counters: TaskCounters) {
        self.applied.store(counters.applied, Ordering::SeqCst);
        self.external.store(counters.external, Ordering::SeqCst);
        self.failed.store(counters.failed, Ordering::SeqCst);
        self.skipped.store(counters.skipped, Ordering::SeqCst);
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn counters(&self) -> TaskCounters {
        TaskCounters {
            applied: self.applied.load(Ordering::SeqCst),
            external: self.external.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }

    /// Zero every counter.
    pub fn reset_counters(&self) {
        self.set_counters(TaskCounters::default());
    }

    /// Pause before each submission.
    #[must_use]
    pub fn pause_before_submit(&self) -> bool {
        self.pause_before_submit.load(Ordering::SeqCst)
    }

    /// Set [`Self::pause_before_submit`].
    pub fn set_pause_before_submit(&self, value: bool) {
        self.pause_before_submit.store(value, Ordering::SeqCst);
    }

    /// Pause on unanswerable questions.
    #[must_use]
    pub fn pause_at_failed_question(&self) -> bool {
        self.pause_at_failed_question.load(Ordering::SeqCst)
    }

    /// Set [`Self::pause_at_failed_question`].
    pub fn set_pause_at_failed_question(&self, value: bool) {
        self.pause_at_failed_question.store(value, Ordering::SeqCst);
    }

    /// Whether the daily limit was hit during this session.
    #[must_use]
    pub fn daily_limit_reached(&self) -> bool {
        self.daily_limit_reached.load(Ordering::SeqCst)
    }

    /// Set [`Self::daily_limit_reached`].
    pub fn set_daily_limit_reached(&self, value: bool) {
        self.daily_limit_reached.store(value, Ordering::SeqCst);
    }

    /// Ask the task to stop.
    pub fn request_stop(&self) {
        self.stop.request();
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Handle that raises this context's stop flag.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Write counters and flags into a legacy namespace.
    pub fn sync_to_legacy(&self, ns: &mut LegacyNamespace) {
        let counters = self.counters();
        ns.insert(legacy_keys::APPLIED.into(), counters.applied.into());
        ns.insert(legacy_keys::EXTERNAL.into(), counters.external.into());
        ns.insert(legacy_keys::FAILED.into(), counters.failed.into());
        ns.insert(legacy_keys::SKIPPED.into(), counters.skipped.into());
        ns.insert(legacy_keys::PAUSE_BEFORE_SUBMIT.into(), self.pause_before_submit().into());
        ns.insert(
            legacy_keys::PAUSE_AT_FAILED_QUESTION.into(),
            self.pause_at_failed_question().into(),
        );
        ns.insert(legacy_keys::DAILY_LIMIT_REACHED.into(), self.daily_limit_reached().into());
    }

    /// Read counters and flags back from a legacy namespace.
    ///
    /// Missing or mistyped keys leave the current value untouched.
    pub fn sync_from_legacy(&self, ns: &LegacyNamespace) {
        let read_u32 = |key: &str, slot: &AtomicU32| {
            if let Some(v) = ns.get(key).and_then(Value::as_u64) {
                slot.store(u32::try_from(v).unwrap_or(u32::MAX), Ordering::SeqCst);
            }
        };
        read_u32(legacy_keys::APPLIED, &self.applied);
        read_u32(legacy_keys::EXTERNAL, &self.external);
        read_u32(legacy_keys::FAILED, &self.failed);
        read_u32(legacy_keys::SKIPPED, &self.skipped);

        let read_bool = |key: &str, slot: &AtomicBool| {
            if let Some(v) = ns.get(key).and_then(Value::as_bool) {
                slot.store(v, Ordering::SeqCst);
            }
        };
        read_bool(legacy_keys::PAUSE_BEFORE_SUBMIT, &self.pause_before_submit);
        read_bool(legacy_keys::PAUSE_AT_FAILED_QUESTION, &self.pause_at_failed_question);
        read_bool(legacy_keys::DAILY_LIMIT_REACHED, &self.daily_limit_reached);
    }
}
