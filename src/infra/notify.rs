//! Best-effort operator notifications.
//!
//! Delivery never fails a session: the dispatcher rate-limits sends, guards
//! the channel with a circuit breaker and logs whatever goes wrong.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{NotificationMethod, SchedulerConfig};
use crate::core::{Breaker, BreakerConfig, BreakerError, RateLimiter};

/// Delivery failures.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The helper program could not be run.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The helper program exited with an error.
    #[error("{program} failed: {stderr}")]
    Failed {
        /// Program name.
        program: String,
        /// Captured stderr.
        stderr: String,
    },
    /// The configuration cannot deliver this notification.
    #[error("notification misconfigured: {0}")]
    Misconfigured(String),
}

/// Which lifecycle moment a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// A session or the scheduler started.
    Start,
    /// A session finished normally.
    Complete,
    /// A session failed.
    Error,
}

/// A message for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Lifecycle moment.
    pub kind: NotificationKind,
    /// Short title.
    pub title: String,
    /// Body text.
    pub message: String,
}

impl Notification {
    /// Build a notification.
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// A delivery channel.
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    ///
    /// # Errors
    ///
    /// The channel rejected or could not deliver it.
    fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        match notification.kind {
            NotificationKind::Error => {
                tracing::warn!(title = %notification.title, "{}", notification.message);
            }
            NotificationKind::Start | NotificationKind::Complete => {
                tracing::info!(title = %notification.title, "{}", notification.message);
            }
        }
        Ok(())
    }
}

/// Discards notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Desktop notification through `osascript` on macOS, `notify-send` elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let (program, mut command) = if cfg!(target_os = "macos") {
            let script = format!(
                r#"display notification "{}" with title "{}""#,
                escape_applescript(&notification.message),
                escape_applescript(&notification.title),
            );
            let mut command = Command::new("osascript");
            command.arg("-e").arg(script);
            ("osascript", command)
        } else {
            let mut command = Command::new("notify-send");
            if notification.kind == NotificationKind::Error {
                command.arg("--urgency=critical");
            }
            command.arg(&notification.title).arg(&notification.message);
            ("notify-send", command)
        };
        let output = command.output().map_err(|source| NotifyError::Spawn {
            program: program.into(),
            source,
        })?;
        if !output.status.success() {
            return Err(NotifyError::Failed {
                program: program.into(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn escape_applescript(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Mail through a local `sendmail -t`.
#[derive(Debug, Clone)]
pub struct EmailNotifier {
    recipient: String,
    sendmail: String,
}

impl EmailNotifier {
    /// Mail to `recipient` using `sendmail` from `PATH`.
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            sendmail: "sendmail".into(),
        }
    }

    /// Use a different sendmail-compatible binary.
    #[must_use]
    pub fn with_sendmail(mut self, program: impl Into<String>) -> Self {
        self.sendmail = program.into();
        self
    }

    fn render(&self, notification: &Notification) -> String {
        format!(
            "To: {}\nSubject: [session-scheduler] {}\n\n{}\n",
            self.recipient, notification.title, notification.message
        )
    }
}

impl Notifier for EmailNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let spawn_err = |source| NotifyError::Spawn {
            program: self.sendmail.clone(),
            source,
        };
        let mut child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.render(notification).as_bytes())
                .map_err(spawn_err)?;
        }
        let output = child.wait_with_output().map_err(spawn_err)?;
        if !output.status.success() {
            return Err(NotifyError::Failed {
                program: self.sendmail.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Channel selected by `cfg.notification_method`.
///
/// # Errors
///
/// Email without a recipient.
pub fn notifier_for(cfg: &SchedulerConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    Ok(match cfg.notification_method {
        NotificationMethod::None => Arc::new(NoopNotifier),
        NotificationMethod::Log => Arc::new(LogNotifier),
        NotificationMethod::Desktop => Arc::new(DesktopNotifier),
        NotificationMethod::Email => {
            let recipient = cfg
                .notification_email
                .clone()
                .ok_or_else(|| NotifyError::Misconfigured("notification_email is not set".into()))?;
            Arc::new(EmailNotifier::new(recipient))
        }
    })
}

/// Filters, throttles and guards outgoing notifications.
pub struct NotificationDispatcher {
    fixed: Option<Arc<dyn Notifier>>,
    breaker: Breaker,
    limiter: RateLimiter,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("fixed", &self.fixed.is_some())
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationDispatcher {
    /// Pick the channel from configuration on every send.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fixed: None,
            breaker: Breaker::new(
                "notifications",
                BreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout: Duration::from_secs(300),
                    half_open_max_calls: 1,
                },
            ),
            // One message every 10s on average, bursts of 5.
            limiter: RateLimiter::new(0.1, 5),
        }
    }

    /// Always deliver through `notifier`.
    #[must_use]
    pub fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            fixed: Some(notifier),
            ..Self::new()
        }
    }

    /// Deliver if `cfg` enables this kind. Returns whether it was sent.
    pub fn dispatch(&self, cfg: &SchedulerConfig, notification: &Notification) -> bool {
        let enabled = match notification.kind {
            NotificationKind::Start => cfg.notify_on_start,
            NotificationKind::Complete => cfg.notify_on_complete,
            NotificationKind::Error => cfg.notify_on_error,
        };
        if !enabled {
            return false;
        }
        let notifier = match &self.fixed {
            Some(notifier) => Arc::clone(notifier),
            None => match notifier_for(cfg) {
                Ok(notifier) => notifier,
                Err(e) => {
                    tracing::warn!(error = %e, "notification skipped");
                    return false;
                }
            },
        };
        if !self.limiter.try_acquire(1) {
            tracing::debug!(title = %notification.title, "notification rate limited");
            return false;
        }
        match self.breaker.call(|| notifier.send(notification)) {
            Ok(()) => true,
            Err(BreakerError::Open { .. }) => {
                tracing::debug!(title = %notification.title, "notification channel circuit open");
                false
            }
            Err(BreakerError::Inner(e)) => {
                tracing::warn!(title = %notification.title, error = %e, "notification failed");
                false
            }
        }
    }
}
