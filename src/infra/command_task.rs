//! Drives the task as a child process.
//!
//! The child receives its session id, settings file and stop file through
//! environment variables. It stops cooperatively once the stop file exists,
//! and reports progress by printing `{"counters": {...}}` lines on stdout;
//! every other stdout line is logged.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::TaskSettings;
use crate::session::{SessionContext, SessionTask, TaskCounters, TaskError, TaskLauncher};
use crate::util::{WaitOutcome, WorkerThread};

/// Variable carrying the session id.
pub const ENV_SESSION_ID: &str = "SESSION_ID";
/// Variable carrying the settings file path.
pub const ENV_SETTINGS_FILE: &str = "SESSION_SETTINGS";
/// Variable carrying the stop file path.
pub const ENV_STOP_FILE: &str = "SESSION_STOP_FILE";
/// Exit code meaning the external dependency disconnected.
pub const EXIT_CONNECTION_LOST: i32 = 75;

#[derive(Deserialize)]
struct ProgressLine {
    counters: TaskCounters,
}

/// Launches a configured program once per session.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    settings_path: Option<PathBuf>,
    work_dir: PathBuf,
    poll_interval: Duration,
}

impl CommandLauncher {
    /// Run `program`, writing per-session files under `work_dir`.
    pub fn new(program: impl Into<String>, work_dir: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            settings_path: None,
            work_dir: work_dir.as_ref().to_path_buf(),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Arguments passed to the program.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Base settings file the task normally uses.
    #[must_use]
    pub fn with_settings_file(mut self, path: impl AsRef<Path>) -> Self {
        self.settings_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// How often the child is polled for exit.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl TaskLauncher for CommandLauncher {
    fn base_settings(&self) -> Result<TaskSettings, TaskError> {
        let Some(path) = &self.settings_path else {
            return Ok(TaskSettings::default());
        };
        let raw = fs::read_to_string(path)
            .map_err(|e| TaskError::Setup(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| TaskError::Setup(format!("invalid settings {}: {e}", path.display())))
    }

    fn prepare(&self, settings: TaskSettings) -> Result<Arc<dyn SessionTask>, TaskError> {
        fs::create_dir_all(&self.work_dir)
            .map_err(|e| TaskError::Setup(format!("cannot create {}: {e}", self.work_dir.display())))?;
        let run_id = Uuid::new_v4();
        let settings_file = self.work_dir.join(format!("settings-{run_id}.json"));
        let rendered = serde_json::to_string_pretty(&settings)
            .map_err(|e| TaskError::Setup(format!("cannot encode settings: {e}")))?;
        fs::write(&settings_file, rendered)
            .map_err(|e| TaskError::Setup(format!("cannot write {}: {e}", settings_file.display())))?;
        Ok(Arc::new(CommandTask {
            program: self.program.clone(),
            args: self.args.clone(),
            work_dir: self.work_dir.clone(),
            stop_file: self.work_dir.join(format!("stop-{run_id}")),
            settings_file,
            poll_interval: self.poll_interval,
            stop: AtomicBool::new(false),
        }))
    }
}

/// One run of the child program.
#[derive(Debug)]
pub struct CommandTask {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
    settings_file: PathBuf,
    stop_file: PathBuf,
    poll_interval: Duration,
    stop: AtomicBool,
}

impl CommandTask {
    fn write_stop_file(&self) {
        if let Err(e) = fs::write(&self.stop_file, b"stop") {
            tracing::warn!(path = %self.stop_file.display(), error = %e, "failed to write stop file");
        }
    }

    fn classify_exit(&self, status: ExitStatus, stopped: bool) -> Result<(), TaskError> {
        if status.success() {
            return Ok(());
        }
        if status.code() == Some(EXIT_CONNECTION_LOST) {
            return Err(TaskError::ConnectionLost(format!("{} reported a lost connection", self.program)));
        }
        if stopped {
            tracing::info!(%status, "task exited after stop request");
            return Ok(());
        }
        Err(TaskError::Failed(format!("{} exited with {status}", self.program)))
    }

    fn remove_run_files(&self) {
        for path in [&self.stop_file, &self.settings_file] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove run file");
                }
            }
        }
    }

    async fn run_child(&self, ctx: Arc<SessionContext>) -> Result<(), TaskError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.work_dir)
            .env(ENV_SESSION_ID, ctx.session_id())
            .env(ENV_SETTINGS_FILE, &self.settings_file)
            .env(ENV_STOP_FILE, &self.stop_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| TaskError::Setup(format!("failed to start {}: {e}", self.program)))?;
        tracing::info!(pid = child.id(), program = %self.program, "task process started");

        let reader = match child.stdout.take() {
            Some(stdout) => {
                let ctx = Arc::clone(&ctx);
                Some(
                    WorkerThread::spawn("task-stdout", move || forward_output(stdout, &ctx))
                        .map_err(|e| TaskError::Setup(format!("cannot read task output: {e}")))?,
                )
            }
            None => None,
        };

        let mut stop_written = false;
        let status = loop {
            if !stop_written && (ctx.stop_requested() || self.stop.load(Ordering::SeqCst)) {
                tracing::info!("asking task process to stop");
                self.write_stop_file();
                stop_written = true;
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => return Err(TaskError::Failed(format!("cannot poll {}: {e}", self.program))),
            }
        };

        // A grandchild may still hold stdout open; do not wait on it forever.
        if let Some(reader) = reader {
            if matches!(reader.wait(Some(Duration::from_secs(2))), WaitOutcome::TimedOut) {
                tracing::debug!("task output still open after exit");
            }
        }
        self.classify_exit(status, stop_written)
    }
}

#[async_trait]
impl SessionTask for CommandTask {
    async fn run(&self, ctx: Arc<SessionContext>) -> Result<(), TaskError> {
        let _ = fs::remove_file(&self.stop_file);
        let result = self.run_child(ctx).await;
        self.remove_run_files();
        result
    }

    fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            self.write_stop_file();
        }
    }
}

fn forward_output(stdout: impl Read, ctx: &SessionContext) {
    for line in BufReader::new(stdout).lines().map_while(Result::ok) {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            if let Ok(progress) = serde_json::from_str::<ProgressLine>(trimmed) {
                ctx.set_counters(progress.counters);
                continue;
            }
        }
        if !trimmed.is_empty() {
            tracing::info!(target: "task", "{trimmed}");
        }
    }
}
