//! Field-level redaction for row payloads before they are rendered.

use regex::Regex;
use serde_json::{Map, Value};

/// Canonical replacement marker for redacted content.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// What to do with a matching field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAction {
    /// Replace the value with [`REDACTION_MARKER`].
    Redact,
    /// Keep the last `keep` characters, replace the rest with `*`.
    Mask {
        /// Visible trailing characters.
        keep: usize,
    },
    /// Remove the field entirely.
    Drop,
}

/// A rule binding a field name to an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    field: String,
    action: FieldAction,
}

impl FieldRule {
    /// Match `field` case-insensitively.
    pub fn new(field: &str, action: FieldAction) -> Self {
        Self {
            field: field.to_ascii_lowercase(),
            action,
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.field == name.to_ascii_lowercase()
    }
}

/// Applies field rules, then scrubs token-like strings from what remains.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    rules: Vec<FieldRule>,
    patterns: Vec<Regex>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Sanitizer {
    /// Create a sanitizer with field rules and the default token patterns.
    pub fn new(rules: Vec<FieldRule>) -> Self {
        Self {
            rules,
            patterns: default_patterns(),
        }
    }

    /// Return a sanitized copy of a row.
    ///
    /// Only top-level fields are matched by rules; the token scan walks
    /// nested strings too.
    pub fn sanitize(&self, row: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        for (name, value) in row {
            match self.rules.iter().find(|rule| rule.matches(name)) {
                Some(rule) => match rule.action {
                    FieldAction::Drop => {}
                    FieldAction::Redact => {
                        out.insert(name.clone(), Value::String(REDACTION_MARKER.to_owned()));
                    }
                    FieldAction::Mask { keep } => {
                        out.insert(name.clone(), Value::String(mask(value, keep)));
                    }
                },
                None => {
                    out.insert(name.clone(), self.scrub(value));
                }
            }
        }
        out
    }

    fn scrub(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.scrub_text(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.scrub(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.scrub(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Replace token-like substrings of free text with [`REDACTION_MARKER`].
    pub fn scrub_text(&self, text: &str) -> String {
        let mut sanitized = text.to_owned();
        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, REDACTION_MARKER)
                .into_owned();
        }
        sanitized
    }
}

fn mask(value: &Value, keep: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => return String::new(),
        other => other.to_string(),
    };
    let total = text.chars().count();
    let hidden = total.saturating_sub(keep);
    text.chars()
        .enumerate()
        .map(|(i, c)| if i < hidden { '*' } else { c })
        .collect()
}

fn default_patterns() -> Vec<Regex> {
    let patterns = [
        r"(?i)bearer\s+[A-Za-z0-9._\-]{16,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"ghp_[A-Za-z0-9]{20,}",
        r"glpat-[A-Za-z0-9_\-]{16,}",
        r"xox[bp]-[A-Za-z0-9\-]{20,}",
        r"\b\d{8,10}:[A-Za-z0-9_\-]{35}\b",
    ];

    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}
