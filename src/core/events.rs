//! Scheduler lifecycle events and sinks.
//!
//! Provides a bounded in-memory sink for tests and dashboards and a sink that
//! forwards events to `tracing`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// The background loop started.
    Started,
    /// The background loop stopped.
    Stopped,
    /// A session is about to run.
    SessionStarted {
        /// Applications the session aims for.
        target: u32,
    },
    /// A session finished and its report was written.
    SessionCompleted {
        /// Session identifier.
        session_id: String,
        /// Reconciled successful applications.
        successful: u32,
        /// Why the session ended.
        exit_reason: String,
    },
    /// The next trigger was (re)computed.
    NextRunScheduled {
        /// Local wall-clock time of the next trigger, if any.
        at: Option<NaiveDateTime>,
    },
    /// A tick failed; the loop backs off and continues.
    Error {
        /// Rendered failure.
        message: String,
    },
}

impl SchedulerEvent {
    /// Short stable name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionCompleted { .. } => "session_completed",
            Self::NextRunScheduled { .. } => "next_run_scheduled",
            Self::Error { .. } => "error",
        }
    }
}

/// Event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Event identifier.
    pub event_id: String,
    /// Payload.
    pub event: SchedulerEvent,
    /// When the event was emitted.
    pub created_at: DateTime<Utc>,
}

/// Event sink abstraction.
pub trait EventSink: Send + Sync {
    /// Record an event. Must not block for long; it runs on the scheduler loop.
    fn record(&self, event: LifecycleEvent);
}

/// Shared sink handle.
pub type SharedEventSink = Arc<dyn EventSink>;

/// In-memory sink with a bounded buffer.
#[derive(Debug)]
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<LifecycleEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a sink keeping at most `max_events`, oldest dropped first.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events)),
            max_events,
        }
    }

    /// Snapshot of stored events.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored event names, oldest first.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event.name()).collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, event: LifecycleEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Sink that logs every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: LifecycleEvent) {
        match &event.event {
            SchedulerEvent::Error { message } => {
                tracing::error!(event_id = %event.event_id, %message, "scheduler error event");
            }
            other => tracing::info!(event_id = %event.event_id, event = other.name(), ?other, "scheduler event"),
        }
    }
}

/// Wrap a payload in an envelope with a fresh id and timestamp.
#[must_use]
pub fn build_event(event: SchedulerEvent) -> LifecycleEvent {
    LifecycleEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        event,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_sink_overflow() {
        let sink = InMemoryEventSink::new(2);
        sink.record(build_event(SchedulerEvent::Started));
        sink.record(build_event(SchedulerEvent::SessionStarted { target: 3 }));
        sink.record(build_event(SchedulerEvent::Stopped));

        assert_eq!(sink.names(), vec!["session_started", "stopped"]);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SchedulerEvent::SessionCompleted {
            session_id: "abc".into(),
            successful: 4,
            exit_reason: "completed (4/5)".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_completed");
        assert_eq!(json["successful"], 4);
    }

    #[test]
    fn test_build_event_assigns_unique_ids() {
        let a = build_event(SchedulerEvent::Started);
        let b = build_event(SchedulerEvent::Started);
        assert_ne!(a.event_id, b.event_id);
    }
}
