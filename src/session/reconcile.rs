//! Cross-checks in-memory success counts against ledger growth.

/// Result of comparing the task's own count with the ledger delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    /// Successes the task counted in memory.
    pub memory: u32,
    /// Rows the success ledger grew by, when both snapshots exist.
    pub ledger_delta: Option<u64>,
    /// Count to report.
    pub reported: u32,
}

/// Reconcile `memory` against success-ledger row counts taken before and
/// after the session.
///
/// When the ledger grew, the smaller of the two counts is reported: a task
/// that over-counts in memory, or rows written by someone else, can never
/// inflate the result. Without a usable positive delta the in-memory count
/// stands.
#[must_use]
pub fn reconcile_successes(memory: u32, before: Option<u64>, after: Option<u64>) -> Reconciliation {
    let ledger_delta = match (before, after) {
        (Some(before), Some(after)) => after.checked_sub(before),
        _ => None,
    };
    let reported = match ledger_delta {
        Some(delta) if delta > 0 => memory.min(u32::try_from(delta).unwrap_or(u32::MAX)),
        _ => memory,
    };
    if ledger_delta.is_some_and(|d| d != u64::from(memory)) {
        tracing::warn!(memory, ledger_delta, reported, "success counts disagree");
    } else {
        tracing::info!(memory, ledger_delta, reported, "success counts reconciled");
    }
    Reconciliation {
        memory,
        ledger_delta,
        reported,
    }
}
