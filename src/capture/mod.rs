//! Change capture: notification parsing, allow-list filtering, diffing and
//! sanitizing of row payloads.
//!
//! A notification is decoded in two steps. [`Notification::parse`] only
//! checks that the payload is JSON and reads the header fields, so the
//! [`EventFilter`] can drop foreign tables before the row bodies are shaped.
//! [`Notification::into_event`] then builds the typed [`ChangeEvent`].

pub mod diff;
pub mod listener;
pub mod sanitizer;

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Errors raised while decoding a notification payload.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The payload is not valid JSON.
    #[error("malformed payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// A required header field is missing or empty.
    #[error("malformed payload: missing {0}")]
    MissingField(&'static str),

    /// The action is neither INSERT nor UPDATE.
    #[error("malformed payload: unsupported action '{0}'")]
    UnsupportedAction(String),

    /// A row body is present but is not a JSON object.
    #[error("malformed payload: {0} is not an object")]
    NotAnObject(&'static str),
}

/// Row-level operation carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
}

impl Action {
    /// Parse an action name case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::UnsupportedAction`] for anything else.
    pub fn parse(raw: &str) -> Result<Self, CaptureError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            _ => Err(CaptureError::UnsupportedAction(raw.to_owned())),
        }
    }

    /// Headline used in rendered messages.
    pub fn headline(self) -> &'static str {
        match self {
            Self::Insert => "Insert",
            Self::Update => "Update",
        }
    }
}

/// Raw notification as published by the trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    /// Table the row belongs to.
    #[serde(default)]
    pub table_name: Option<String>,
    /// Database that emitted the notification.
    #[serde(default)]
    pub database_name: Option<String>,
    /// `INSERT` or `UPDATE`.
    #[serde(default)]
    pub action: Option<String>,
    /// Inserted row.
    #[serde(default)]
    pub data: Option<Value>,
    /// Row after an update.
    #[serde(default)]
    pub new_data: Option<Value>,
    /// Row before an update.
    #[serde(default)]
    pub old_data: Option<Value>,
}

impl Notification {
    /// Decode the JSON payload of a notification.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::InvalidJson`] when the payload does not decode.
    pub fn parse(payload: &str) -> Result<Self, CaptureError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Table name, empty when absent.
    pub fn table(&self) -> &str {
        self.table_name.as_deref().unwrap_or_default()
    }

    /// Database name, empty when absent.
    pub fn database(&self) -> &str {
        self.database_name.as_deref().unwrap_or_default()
    }

    /// Shape the notification into a typed event.
    ///
    /// INSERT reads `data` (falling back to `new_data`); UPDATE reads
    /// `new_data` and `old_data`, treating an absent old row as empty.
    ///
    /// # Errors
    ///
    /// Returns a [`CaptureError`] when a header field is missing, the action
    /// is unsupported, or a row body is not an object.
    pub fn into_event(self, key_field: &str) -> Result<ChangeEvent, CaptureError> {
        let table = non_empty(self.table_name, "table_name")?;
        let database = non_empty(self.database_name, "database_name")?;
        let action = Action::parse(self.action.as_deref().unwrap_or_default())?;

        let (new_data, old_data) = match action {
            Action::Insert => {
                let body = self.data.or(self.new_data);
                (object(body, "data")?, None)
            }
            Action::Update => (
                object(self.new_data, "new_data")?,
                Some(object(self.old_data, "old_data")?),
            ),
        };

        let row_id = new_data.get(key_field).cloned().filter(|v| !v.is_null());

        Ok(ChangeEvent {
            database,
            table,
            action,
            row_id,
            new_data,
            old_data,
        })
    }
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, CaptureError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(CaptureError::MissingField(field))
}

fn object(value: Option<Value>, field: &'static str) -> Result<Map<String, Value>, CaptureError> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(CaptureError::NotAnObject(field)),
    }
}

/// A captured row change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Database that emitted the change.
    pub database: String,
    /// Table the row belongs to.
    pub table: String,
    /// INSERT or UPDATE.
    pub action: Action,
    /// Value of the key field in the new row, if any.
    pub row_id: Option<Value>,
    /// Inserted row, or the row after an update.
    pub new_data: Map<String, Value>,
    /// Row before an update.
    pub old_data: Option<Map<String, Value>>,
}

/// Table and database allow-list.
#[derive(Debug, Clone)]
pub struct EventFilter {
    table: String,
    databases: BTreeSet<String>,
}

impl EventFilter {
    /// Accept only `table` from the given databases.
    pub fn new(table: impl Into<String>, databases: BTreeSet<String>) -> Self {
        Self {
            table: table.into(),
            databases,
        }
    }

    /// Whether a notification from `database` about `table` is relayed.
    pub fn accepts(&self, table: &str, database: &str) -> bool {
        table == self.table && self.databases.contains(database)
    }
}
