//! Shallow field-level diff between two row versions.

use serde_json::{Map, Value};

/// Fields of `new` whose value differs from `old`, plus `key_field`.
///
/// Values are compared as whole JSON values; nested objects are not
/// descended into. Fields present only in `old` are not reported. The key
/// field is copied from `new` even when unchanged, and omitted when `new`
/// lacks it.
pub fn diff_rows(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    key_field: &str,
) -> Map<String, Value> {
    let mut changed: Map<String, Value> = new
        .iter()
        .filter(|(field, value)| old.get(field.as_str()) != Some(*value))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect();

    if let Some(key) = new.get(key_field) {
        changed.insert(key_field.to_owned(), key.clone());
    }

    changed
}
