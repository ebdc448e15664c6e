//! Tests for dialect rendering and escaping.

use serde_json::{json, Map, Value};

use tblwatch::capture::sanitizer::{FieldAction, FieldRule, Sanitizer};
use tblwatch::capture::{Action, ChangeEvent};
use tblwatch::format::{escape_code, escape_markdown, Dialect, Formatter, Rendered};

fn row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("test row should be an object, got {other}"),
    }
}

fn event(action: Action, new_data: Value, old_data: Option<Value>) -> ChangeEvent {
    let new_data = row(new_data);
    ChangeEvent {
        database: "shop".to_owned(),
        table: "order_items".to_owned(),
        action,
        row_id: new_data.get("id").cloned(),
        new_data,
        old_data: old_data.map(row),
    }
}

#[test]
fn markdown_escapes_every_control_character() {
    assert_eq!(escape_markdown("a_b*c.d!"), "a\\_b\\*c\\.d\\!");
    assert_eq!(escape_markdown("x-y=z"), "x\\-y\\=z");
    assert_eq!(escape_markdown("plain"), "plain");
    assert_eq!(escape_markdown("back\\slash"), "back\\\\slash");
}

#[test]
fn code_escape_only_touches_backslash_and_backtick() {
    assert_eq!(escape_code("a`b\\c_d"), "a\\`b\\\\c_d");
}

#[test]
fn plain_change_is_fenced_json() {
    let rendered = Rendered::Change {
        headline: "Insert",
        table: "orders".to_owned(),
        body: json!({"id": 1}),
    };
    assert_eq!(
        rendered.render(Dialect::Plain),
        "Insert *orders*:\n```json\n{\n  \"id\": 1\n}\n```\n"
    );
}

#[test]
fn telegram_change_escapes_table_name() {
    let rendered = Rendered::Change {
        headline: "Update",
        table: "order_items".to_owned(),
        body: json!({"id": 1}),
    };
    let text = rendered.render(Dialect::TelegramMarkdown);
    assert!(text.starts_with("Update *order\\_items*:\n```json\n"));
    assert!(text.ends_with("\n```\n"));
}

#[test]
fn otp_renders_compact_line_per_dialect() {
    let rendered = Rendered::Otp {
        identifier: "user@x.com".to_owned(),
        code: "123456".to_owned(),
    };
    assert_eq!(rendered.render(Dialect::Plain), "user@x.com --> 123456\n");
    assert_eq!(
        rendered.render(Dialect::TelegramMarkdown),
        "user@x\\.com \\-\\-\\> `123456`\n"
    );
}

#[tokio::test]
async fn update_is_reduced_to_its_diff() {
    let formatter = Formatter::new("id", Sanitizer::default());
    let event = event(
        Action::Update,
        json!({"id": 1, "status": "B", "name": "x"}),
        Some(json!({"id": 1, "status": "A", "name": "x"})),
    );

    let rendered = formatter.format(&event).await.expect("format should succeed");
    assert_eq!(
        rendered,
        Rendered::Change {
            headline: "Update",
            table: "order_items".to_owned(),
            body: json!({"id": 1, "status": "B"}),
        }
    );
}

#[tokio::test]
async fn insert_is_sanitized() {
    let sanitizer = Sanitizer::new(vec![FieldRule::new("secret", FieldAction::Drop)]);
    let formatter = Formatter::new("id", sanitizer);
    let event = event(Action::Insert, json!({"id": 5, "secret": "s"}), None);

    match formatter.format(&event).await {
        Ok(Rendered::Change { body, headline, .. }) => {
            assert_eq!(headline, "Insert");
            assert_eq!(body, json!({"id": 5}));
        }
        other => panic!("expected change, got {other:?}"),
    }
}
