//! Adapters to the outside world: outcome ledgers, notification channels,
//! liveness probes and the child-process task.

pub mod command_task;
pub mod ledger;
pub mod notify;
pub mod probe;

pub use command_task::{CommandLauncher, CommandTask};
pub use ledger::{CsvLedger, Ledger, LedgerCounts, LedgerError, LedgerSet, LEDGER_HEADER};
pub use notify::{
    notifier_for, DesktopNotifier, EmailNotifier, LogNotifier, NoopNotifier, Notification, NotificationDispatcher,
    NotificationKind, Notifier, NotifyError,
};
pub use probe::TcpProbe;
