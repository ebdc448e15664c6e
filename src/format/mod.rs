//! Destination-specific rendering of change events.
//!
//! A [`Formatter`] turns a [`ChangeEvent`] into a dialect-independent
//! [`Rendered`] value once; each destination then asks for its own text with
//! [`Rendered::render`]. This is what lets one event produce a MarkdownV2
//! variant for Telegram and a plain variant for Rocket.Chat.

pub mod otp;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::capture::diff::diff_rows;
use crate::capture::sanitizer::Sanitizer;
use crate::capture::{Action, ChangeEvent};
use crate::outbound::LengthUnit;

use self::otp::{LookupError, OtpLookup};

/// Characters that must be backslash-escaped in Telegram MarkdownV2 text.
const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

/// Markup dialect of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Telegram MarkdownV2: control characters are escaped.
    TelegramMarkdown,
    /// Rocket.Chat markdown: text is passed through.
    Plain,
}

impl Dialect {
    /// Unit the destination's length limits are counted in.
    pub fn length_unit(self) -> LengthUnit {
        match self {
            Self::TelegramMarkdown => LengthUnit::Utf16,
            Self::Plain => LengthUnit::Chars,
        }
    }
}

/// Escape MarkdownV2 control characters in free text.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape text placed inside MarkdownV2 `code` or `pre` entities.
pub fn escape_code(text: &str) -> String {
    text.replace('\\', "\\\\").replace('`', "\\`")
}

/// A formatted change, not yet bound to a dialect.
#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    /// Generic insert/update message with a JSON body.
    Change {
        /// `Insert` or `Update`.
        headline: &'static str,
        /// Source table.
        table: String,
        /// Sanitized row or diff.
        body: Value,
    },
    /// Compact one-time-code message.
    Otp {
        /// Who the code is for.
        identifier: String,
        /// The code.
        code: String,
    },
}

impl Rendered {
    /// Render for a destination. The text always ends with a newline.
    pub fn render(&self, dialect: Dialect) -> String {
        match self {
            Self::Change {
                headline,
                table,
                body,
            } => {
                let json = serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string());
                match dialect {
                    Dialect::TelegramMarkdown => format!(
                        "{headline} *{}*:\n```json\n{}\n```\n",
                        escape_markdown(table),
                        escape_code(&json)
                    ),
                    Dialect::Plain => format!("{headline} *{table}*:\n```json\n{json}\n```\n"),
                }
            }
            Self::Otp { identifier, code } => match dialect {
                Dialect::TelegramMarkdown => format!(
                    "{} \\-\\-\\> `{}`\n",
                    escape_markdown(identifier),
                    escape_code(code)
                ),
                Dialect::Plain => format!("{identifier} --> {code}\n"),
            },
        }
    }
}

/// Where the one-time-code flow applies and which field triggers it.
#[derive(Debug, Clone)]
pub struct OtpRoute {
    /// Code table name.
    pub table: String,
    /// Field whose presence in the change triggers the lookup.
    pub code_field: String,
    /// Databases the lookup may run against.
    pub databases: BTreeSet<String>,
}

/// Builds [`Rendered`] values from change events.
pub struct Formatter {
    key_field: String,
    sanitizer: Sanitizer,
    otp: Option<(OtpRoute, Arc<dyn OtpLookup>)>,
}

impl std::fmt::Debug for Formatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Formatter")
            .field("key_field", &self.key_field)
            .field("otp", &self.otp.as_ref().map(|(route, _)| route))
            .finish_non_exhaustive()
    }
}

impl Formatter {
    /// Formatter without the one-time-code flow.
    pub fn new(key_field: impl Into<String>, sanitizer: Sanitizer) -> Self {
        Self {
            key_field: key_field.into(),
            sanitizer,
            otp: None,
        }
    }

    /// Enable the one-time-code flow.
    pub fn with_otp(mut self, route: OtpRoute, lookup: Arc<dyn OtpLookup>) -> Self {
        self.otp = Some((route, lookup));
        self
    }

    /// Format an event.
    ///
    /// Updates are reduced to their diff; inserts are sanitized. When the
    /// change hits the one-time-code table and carries a code, the row is
    /// looked up and the compact form is returned instead.
    ///
    /// # Errors
    ///
    /// Returns a [`LookupError`] when the one-time-code lookup fails or finds
    /// no row.
    pub async fn format(&self, event: &ChangeEvent) -> Result<Rendered, LookupError> {
        let change = match event.action {
            Action::Insert => event.new_data.clone(),
            Action::Update => {
                let empty = Map::new();
                let old = event.old_data.as_ref().unwrap_or(&empty);
                diff_rows(old, &event.new_data, &self.key_field)
            }
        };

        if let Some((route, lookup)) = &self.otp {
            if is_otp_change(route, event, &change) {
                let id = event.row_id.as_ref().ok_or(LookupError::MissingId)?;
                let row = lookup
                    .fetch(&event.database, id)
                    .await?
                    .ok_or_else(|| LookupError::NotFound {
                        database: event.database.clone(),
                        id: id_text(id),
                    })?;
                return Ok(Rendered::Otp {
                    identifier: row.identifier,
                    code: row.code,
                });
            }
        }

        let body = match event.action {
            Action::Insert => self.sanitizer.sanitize(&change),
            Action::Update => change,
        };

        Ok(Rendered::Change {
            headline: event.action.headline(),
            table: event.table.clone(),
            body: Value::Object(body),
        })
    }
}

fn is_otp_change(route: &OtpRoute, event: &ChangeEvent, change: &Map<String, Value>) -> bool {
    event.table == route.table
        && route.databases.contains(&event.database)
        && change.get(&route.code_field).is_some_and(is_present)
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Bool(b) => *b,
        _ => true,
    }
}

/// Text form of a row id, without JSON quotes for strings.
pub fn id_text(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
