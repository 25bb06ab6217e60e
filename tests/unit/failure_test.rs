//! Tests for failure kinds and failure values

use prometheus_flow_runtime::core::{Failure, FailureKinds, FailureOrigin, KindId};
use serde_json::json;

#[test]
fn test_builtin_kinds() {
    let kinds = FailureKinds::new();
    assert_eq!(kinds.len(), 3);
    assert_eq!(kinds.lookup("failure"), Some(KindId::FAILURE));
    assert_eq!(kinds.lookup("runtime"), Some(KindId::RUNTIME));
    assert_eq!(kinds.lookup("panic"), Some(KindId::PANIC));
    assert_eq!(kinds.parent(KindId::FAILURE), None);
}

#[test]
fn test_distance_follows_parents() {
    let mut kinds = FailureKinds::new();
    let io = kinds.define("io", None).unwrap();
    let timeout = kinds.define("timeout", Some(io)).unwrap();

    assert_eq!(kinds.distance(timeout, timeout), Some(0));
    assert_eq!(kinds.distance(timeout, io), Some(1));
    assert_eq!(kinds.distance(timeout, KindId::FAILURE), Some(2));
    assert_eq!(kinds.distance(io, timeout), None);
    assert_eq!(kinds.distance(timeout, KindId::RUNTIME), None);
    assert_eq!(kinds.name(timeout), "timeout");
}

#[test]
fn test_define_rejects_duplicates() {
    let mut kinds = FailureKinds::new();
    kinds.define("io", None).unwrap();
    assert!(kinds.define("io", None).is_err());
    assert!(kinds.define("runtime", None).is_err());
}

#[test]
fn test_first_origin_sticks() {
    let failure = Failure::runtime("gone")
        .originating(FailureOrigin::Load {
            resource: "db".into(),
        })
        .originating(FailureOrigin::Unit { node: "n".into() });
    assert_eq!(
        failure.origin(),
        &FailureOrigin::Load {
            resource: "db".into()
        }
    );
}

#[test]
fn test_handler_failure_keeps_cause() {
    let cause = Failure::runtime("disk gone");
    let failure = Failure::runtime("retry failed").raised_by_handler("retry", cause.clone());
    assert!(failure.is_handler_failure());
    assert_eq!(failure.handler(), Some("retry"));
    assert_eq!(failure.handled(), Some(&cause));
    assert!(!cause.is_handler_failure());
}

#[test]
fn test_failure_json_form() {
    let failure = Failure::new(KindId::PANIC, "kaboom").with_detail(json!({ "thread": "w1" }));
    let value = failure.to_value();
    assert_eq!(value["message"], "kaboom");
    assert_eq!(value["detail"]["thread"], "w1");
    assert_eq!(value["origin"]["origin"], "unspecified");
    assert_eq!(format!("{failure}"), "kaboom");
}
