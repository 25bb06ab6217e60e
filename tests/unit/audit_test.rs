//! Tests for audit sink

use prometheus_flow_runtime::core::{build_audit_event, AuditSink, InMemoryAuditSink, NoopAuditSink};
use serde_json::json;
use uuid::Uuid;

#[test]
fn test_in_memory_audit_sink() {
    let sink = InMemoryAuditSink::new(10);
    let process = Uuid::new_v4();
    let flow = Uuid::new_v4();

    sink.record(build_audit_event(process, Some(flow), "load", "flow_started", None));
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].process, process);
    assert_eq!(events[0].flow, Some(flow));
    assert_eq!(events[0].subject, "load");
    assert_eq!(events[0].action, "flow_started");
}

#[test]
fn test_audit_sink_overflow() {
    let sink = InMemoryAuditSink::new(2);
    let process = Uuid::new_v4();

    sink.record(build_audit_event(process, None, "a", "escalated", None));
    sink.record(build_audit_event(process, None, "b", "escalated", None));
    sink.record(build_audit_event(process, None, "c", "enforced", None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].subject, "b"); // First one popped
    assert_eq!(events[1].subject, "c");
    assert_eq!(sink.with_action("escalated").len(), 1);
}

#[test]
fn test_build_audit_event() {
    let process = Uuid::new_v4();
    let event = build_audit_event(process, None, "process", "process_closed", Some(json!({ "resources_unloaded": 2 })));

    assert_eq!(event.process, process);
    assert_eq!(event.flow, None);
    assert_eq!(event.action, "process_closed");
    assert_eq!(event.detail, Some(json!({ "resources_unloaded": 2 })));
    assert!(event.created_at_ms > 0);
    assert_ne!(event.event_id, Uuid::nil());
}

#[test]
fn test_audit_event_serializes() {
    let event = build_audit_event(Uuid::new_v4(), None, "uow", "disregarded", None);
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["action"], "disregarded");
    assert_eq!(value["subject"], "uow");
}

#[test]
fn test_noop_sink_discards() {
    NoopAuditSink.record(build_audit_event(Uuid::new_v4(), None, "n", "fatal", None));
}
