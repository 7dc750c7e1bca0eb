//! `session-scheduler` command line.
//!
//! Runs one session on demand, or stays resident and runs sessions on the
//! configured schedule until interrupted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};

use session_scheduler::builders::JobSchedulerBuilder;
use session_scheduler::config::{ConfigSource, SchedulerConfig};
use session_scheduler::core::ResourceRegistry;
use session_scheduler::infra::{CommandLauncher, LedgerSet, NotificationDispatcher};
use session_scheduler::scheduler::{next_run_time, SchedulerStateStore};
use session_scheduler::session::SessionRunner;
use session_scheduler::util::init_tracing;

#[derive(Parser)]
#[command(
    name = "session-scheduler",
    version,
    about = "Run unattended automation sessions on a schedule"
)]
struct Cli {
    /// Scheduler configuration (JSON).
    #[arg(long, env = "SESSION_SCHEDULER_CONFIG", default_value = "scheduler_config.json")]
    config: PathBuf,
    /// Persistent scheduler state (JSON).
    #[arg(long, env = "SESSION_SCHEDULER_STATE", default_value = "scheduler_state.json")]
    state: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct TaskArgs {
    /// Program that performs one session.
    #[arg(long = "task-cmd")]
    program: String,
    /// Argument for the task program; repeatable.
    #[arg(long = "task-arg", allow_hyphen_values = true)]
    args: Vec<String>,
    /// Base settings file for the task.
    #[arg(long = "task-settings")]
    settings: Option<PathBuf>,
    /// Directory for per-session settings and stop files.
    #[arg(long, default_value = "work")]
    work_dir: PathBuf,
    /// Directory holding `applied.csv` and `failed.csv`.
    #[arg(long, env = "SESSION_SCHEDULER_LEDGER_DIR", default_value = "ledger")]
    ledger_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single session now and exit.
    RunOnce(TaskArgs),
    /// Run sessions on schedule until Ctrl-C.
    Daemon(TaskArgs),
    /// Validate and print the effective configuration and next trigger.
    Config,
    /// Print the persisted scheduler state.
    Status,
}

fn main() {
    let _ = dotenvy::dotenv();
    init_tracing("info");
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            1
        }
    };
    let summary = ResourceRegistry::global().cleanup_all();
    tracing::debug!(?summary, "process cleanup finished");
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::RunOnce(task) => cmd_run_once(&cli.config, &cli.state, &task),
        Command::Daemon(task) => cmd_daemon(&cli.config, &cli.state, &task),
        Command::Config => cmd_config(&cli.config, &cli.state),
        Command::Status => cmd_status(&cli.state),
    }
}

fn install_interrupt() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, stopping...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;
    Ok(interrupted)
}

fn build_runner(
    config: &Path,
    state: &Path,
    task: &TaskArgs,
    interrupted: Arc<AtomicBool>,
    notifier: Arc<NotificationDispatcher>,
) -> SessionRunner {
    let mut launcher = CommandLauncher::new(task.program.clone(), &task.work_dir).with_args(task.args.clone());
    if let Some(settings) = &task.settings {
        launcher = launcher.with_settings_file(settings);
    }
    SessionRunner::new(
        ConfigSource::File(config.to_path_buf()),
        Arc::new(launcher),
        LedgerSet::in_dir(&task.ledger_dir),
        SchedulerStateStore::new(state),
    )
    .with_interrupt_flag(interrupted)
    .with_notifier(notifier)
}

fn cmd_run_once(config: &Path, state: &Path, task: &TaskArgs) -> Result<i32> {
    let interrupted = install_interrupt()?;
    let notifier = Arc::new(NotificationDispatcher::new());
    let runner = build_runner(config, state, task, interrupted, Arc::clone(&notifier));
    // Counts toward, and is capped by, today's allowance like a scheduled run.
    let scheduler = JobSchedulerBuilder::new(
        ConfigSource::File(config.to_path_buf()),
        Arc::new(runner),
        SchedulerStateStore::new(state),
    )
    .notifier(notifier)
    .build();
    let report = scheduler.run_now().context("run session")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(i32::from(report.is_failure()))
}

fn cmd_daemon(config: &Path, state: &Path, task: &TaskArgs) -> Result<i32> {
    let source = ConfigSource::File(config.to_path_buf());
    let cfg = source.load().context("load scheduler configuration")?;
    if !cfg.enabled {
        bail!("scheduling is disabled; set \"enabled\": true in {}", config.display());
    }
    let interrupted = install_interrupt()?;
    let notifier = Arc::new(NotificationDispatcher::new());
    let runner = build_runner(config, state, task, Arc::clone(&interrupted), Arc::clone(&notifier));
    let scheduler = JobSchedulerBuilder::new(source, Arc::new(runner), SchedulerStateStore::new(state))
        .notifier(notifier)
        .build();
    scheduler.start()?;
    while !interrupted.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(250));
    }
    scheduler.stop();
    Ok(0)
}

fn cmd_config(config: &Path, state: &Path) -> Result<i32> {
    let cfg = SchedulerConfig::load(config).with_context(|| format!("load {}", config.display()))?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    let last_run = SchedulerStateStore::new(state).load().last_run_time;
    match next_run_time(&cfg, Local::now().naive_local(), last_run)? {
        Some(next) => println!("next run: {}", next.format("%Y-%m-%d %H:%M")),
        None => println!("next run: not scheduled"),
    }
    Ok(0)
}

fn cmd_status(state: &Path) -> Result<i32> {
    let state = SchedulerStateStore::new(state).load();
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(0)
}
