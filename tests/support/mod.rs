//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use session_scheduler::config::{ConfigSource, SchedulerConfig, TaskSettings};
use session_scheduler::infra::{CsvLedger, LedgerSet, LEDGER_HEADER};
use session_scheduler::scheduler::SchedulerStateStore;
use session_scheduler::session::{
    LivenessProbe, RunnerTimings, SessionContext, SessionRunner, SessionTask, TaskError, TaskLauncher,
};

// ============================================================================
// TASKS
// ============================================================================

/// Applies `memory` times in memory, writing `ledger_rows` rows to the ledger.
pub struct ScriptedTask {
    pub memory: u32,
    pub ledger_rows: u32,
    pub ledger: CsvLedger,
}

#[async_trait]
impl SessionTask for ScriptedTask {
    async fn run(&self, ctx: Arc<SessionContext>) -> Result<(), TaskError> {
        for i in 0..self.memory {
            ctx.record_applied();
            if i < self.ledger_rows {
                let id = format!("job-{i}");
                self.ledger
                    .append(&["now", ctx.session_id(), id.as_str(), "Engineer", "Acme", ""])
                    .map_err(|e| TaskError::Failed(e.to_string()))?;
            }
        }
        Ok(())
    }
}

/// Runs until asked to stop.
#[derive(Default)]
pub struct CooperativeTask;

#[async_trait]
impl SessionTask for CooperativeTask {
    async fn run(&self, ctx: Arc<SessionContext>) -> Result<(), TaskError> {
        while !ctx.stop_requested() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ctx.record_skipped();
        Ok(())
    }
}

/// Ignores stop requests until `release` is set (or 10s pass).
#[derive(Default)]
pub struct StuckTask {
    pub release: Arc<AtomicBool>,
}

#[async_trait]
impl SessionTask for StuckTask {
    async fn run(&self, _ctx: Arc<SessionContext>) -> Result<(), TaskError> {
        let started = Instant::now();
        while !self.release.load(Ordering::SeqCst) && started.elapsed() < Duration::from_secs(10) {
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

/// Fails immediately with a lost dependency.
pub struct DisconnectingTask;

#[async_trait]
impl SessionTask for DisconnectingTask {
    async fn run(&self, _ctx: Arc<SessionContext>) -> Result<(), TaskError> {
        Err(TaskError::ConnectionLost("browser went away".into()))
    }
}

/// Panics mid-run.
pub struct PanickingTask;

#[async_trait]
impl SessionTask for PanickingTask {
    async fn run(&self, ctx: Arc<SessionContext>) -> Result<(), TaskError> {
        ctx.record_applied();
        panic!("selector not found");
    }
}

// ============================================================================
// LAUNCHER
// ============================================================================

/// Hands out a fixed task and remembers the settings it was prepared with.
pub struct FakeLauncher {
    pub task: Option<Arc<dyn SessionTask>>,
    pub prepared_with: Mutex<Option<TaskSettings>>,
}

impl FakeLauncher {
    pub fn new(task: Arc<dyn SessionTask>) -> Arc<Self> {
        Arc::new(Self {
            task: Some(task),
            prepared_with: Mutex::new(None),
        })
    }

    pub fn missing() -> Arc<Self> {
        Arc::new(Self {
            task: None,
            prepared_with: Mutex::new(None),
        })
    }
}

impl TaskLauncher for FakeLauncher {
    fn base_settings(&self) -> Result<TaskSettings, TaskError> {
        if self.task.is_none() {
            return Err(TaskError::Setup("bot module not found".into()));
        }
        Ok(TaskSettings {
            pause_before_submit: true,
            ..TaskSettings::default()
        })
    }

    fn prepare(&self, settings: TaskSettings) -> Result<Arc<dyn SessionTask>, TaskError> {
        *self.prepared_with.lock() = Some(settings);
        self.task
            .clone()
            .ok_or_else(|| TaskError::Setup("bot module not found".into()))
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub fn fast_timings() -> RunnerTimings {
    RunnerTimings {
        watchdog_poll: Duration::from_millis(20),
        watchdog_join: Duration::from_secs(1),
        stop_grace: Duration::from_millis(200),
        interrupt_poll: Duration::from_millis(10),
    }
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        max_applications: 5,
        max_runtime_minutes: 1.0,
        ..SchedulerConfig::default()
    }
}

pub fn applied_ledger(dir: &Path) -> CsvLedger {
    CsvLedger::new("applied", dir.join("ledger/applied.csv"), LEDGER_HEADER)
}

pub fn runner(
    dir: &Path,
    config: impl Into<ConfigSource>,
    launcher: Arc<dyn TaskLauncher>,
    probe: Arc<dyn LivenessProbe>,
) -> SessionRunner {
    SessionRunner::new(
        config.into(),
        launcher,
        LedgerSet::in_dir(dir.join("ledger")),
        SchedulerStateStore::new(dir.join("state.json")),
    )
    .with_probe(probe)
    .with_timings(fast_timings())
}
