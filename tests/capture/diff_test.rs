//! Tests for `src/capture/diff.rs`.

use serde_json::{json, Map, Value};

use tblwatch::capture::diff::diff_rows;

fn row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("test row should be an object, got {other}"),
    }
}

#[test]
fn reports_changed_fields_and_key() {
    let old = row(json!({"id": 1, "status": "A", "name": "x"}));
    let new = row(json!({"id": 1, "status": "B", "name": "x"}));

    let diff = diff_rows(&old, &new, "id");
    assert_eq!(Value::Object(diff), json!({"id": 1, "status": "B"}));
}

#[test]
fn identical_rows_yield_only_the_key() {
    let old = row(json!({"id": 7, "status": "A"}));
    let diff = diff_rows(&old, &old.clone(), "id");
    assert_eq!(Value::Object(diff), json!({"id": 7}));
}

#[test]
fn added_fields_count_as_changed_and_removed_fields_are_ignored() {
    let old = row(json!({"id": 1, "gone": true}));
    let new = row(json!({"id": 1, "fresh": null}));

    let diff = diff_rows(&old, &new, "id");
    assert_eq!(Value::Object(diff), json!({"id": 1, "fresh": null}));
}

#[test]
fn nested_values_compare_as_a_whole() {
    let old = row(json!({"id": 1, "meta": {"a": 1, "b": 2}}));
    let new = row(json!({"id": 1, "meta": {"a": 1, "b": 3}}));

    let diff = diff_rows(&old, &new, "id");
    assert_eq!(diff.get("meta"), Some(&json!({"a": 1, "b": 3})));
}

#[test]
fn missing_key_field_is_omitted() {
    let old = row(json!({"status": "A"}));
    let new = row(json!({"status": "B"}));

    let diff = diff_rows(&old, &new, "id");
    assert_eq!(Value::Object(diff), json!({"status": "B"}));
}
