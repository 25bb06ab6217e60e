//! Audit trail of flow, escalation and oversight events.
//!
//! The engine records one event per lifecycle step it takes on behalf of a
//! flow. Sinks are shared across worker threads, so recording takes `&self`.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::clock::now_ms;

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: Uuid,
    /// Process scope the event belongs to.
    pub process: Uuid,
    /// Flow (thread scope), if the event belongs to one.
    pub flow: Option<Uuid>,
    /// Node, resource, oversight or handler the event is about.
    pub subject: String,
    /// Action taken (`flow_started`, `flow_finished`, `escalated`,
    /// `default_handler`, `enforced`, `disregarded`, `fatal`,
    /// `process_closed`).
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub detail: Option<serde_json::Value>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: AuditEvent);
}

/// Sink discarding every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

/// In-memory audit sink for testing and dev.
#[derive(Debug)]
pub struct InMemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink keeping at most `max_events`.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events with the given action.
    #[must_use]
    pub fn with_action(&self, action: &str) -> Vec<AuditEvent> {
        self.events.lock().iter().filter(|e| e.action == action).cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Helper to build an audit event stamped now.
pub fn build_audit_event(
    process: Uuid,
    flow: Option<Uuid>,
    subject: impl Into<String>,
    action: impl Into<String>,
    detail: Option<serde_json::Value>,
) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4(),
        process,
        flow,
        subject: subject.into(),
        action: action.into(),
        created_at_ms: now_ms(),
        detail,
    }
}
