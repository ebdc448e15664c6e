//! Tests for notification decoding and the allow-list filter.

use std::collections::BTreeSet;

use serde_json::json;

use tblwatch::capture::{Action, CaptureError, EventFilter, Notification};

fn decode(payload: &serde_json::Value) -> Notification {
    match Notification::parse(&payload.to_string()) {
        Ok(notification) => notification,
        Err(err) => panic!("payload should decode: {err}"),
    }
}

#[test]
fn insert_reads_data_and_row_id() {
    let notification = decode(&json!({
        "table_name": "orders",
        "database_name": "shop",
        "action": "INSERT",
        "data": {"id": 42, "total": 10}
    }));

    let event = notification.into_event("id").expect("insert should shape");
    assert_eq!(event.action, Action::Insert);
    assert_eq!(event.table, "orders");
    assert_eq!(event.database, "shop");
    assert_eq!(event.row_id, Some(json!(42)));
    assert_eq!(event.new_data.get("total"), Some(&json!(10)));
    assert!(event.old_data.is_none());
}

#[test]
fn insert_falls_back_to_new_data() {
    let notification = decode(&json!({
        "table_name": "orders",
        "database_name": "shop",
        "action": "insert",
        "new_data": {"id": "abc"}
    }));

    let event = notification.into_event("id").expect("insert should shape");
    assert_eq!(event.row_id, Some(json!("abc")));
}

#[test]
fn update_without_old_data_uses_empty_row() {
    let notification = decode(&json!({
        "table_name": "orders",
        "database_name": "shop",
        "action": "UPDATE",
        "new_data": {"id": 1, "status": "B"}
    }));

    let event = notification.into_event("id").expect("update should shape");
    assert_eq!(event.action, Action::Update);
    assert_eq!(event.old_data.map(|m| m.len()), Some(0));
}

#[test]
fn null_key_is_not_a_row_id() {
    let notification = decode(&json!({
        "table_name": "orders",
        "database_name": "shop",
        "action": "INSERT",
        "data": {"id": null}
    }));

    let event = notification.into_event("id").expect("insert should shape");
    assert_eq!(event.row_id, None);
}

#[test]
fn invalid_json_is_malformed() {
    assert!(matches!(
        Notification::parse("{not json"),
        Err(CaptureError::InvalidJson(_))
    ));
}

#[test]
fn delete_is_unsupported() {
    let notification = decode(&json!({
        "table_name": "orders",
        "database_name": "shop",
        "action": "DELETE",
        "old_data": {"id": 1}
    }));

    match notification.into_event("id") {
        Err(CaptureError::UnsupportedAction(action)) => assert_eq!(action, "DELETE"),
        other => panic!("expected unsupported action, got {other:?}"),
    }
}

#[test]
fn missing_table_name_is_reported() {
    let notification = decode(&json!({
        "database_name": "shop",
        "action": "INSERT",
        "data": {}
    }));

    assert!(matches!(
        notification.into_event("id"),
        Err(CaptureError::MissingField("table_name"))
    ));
}

#[test]
fn non_object_row_is_rejected() {
    let notification = decode(&json!({
        "table_name": "orders",
        "database_name": "shop",
        "action": "INSERT",
        "data": [1, 2]
    }));

    assert!(matches!(
        notification.into_event("id"),
        Err(CaptureError::NotAnObject("data"))
    ));
}

#[test]
fn filter_requires_table_and_database() {
    let filter = EventFilter::new("orders", BTreeSet::from(["shop".to_owned()]));

    assert!(filter.accepts("orders", "shop"));
    assert!(!filter.accepts("orders", "other"));
    assert!(!filter.accepts("users", "shop"));
    assert!(!filter.accepts("", ""));
}
