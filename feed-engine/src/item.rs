//! Field access on normalized items, shared by filters, sorting and templates.

use crate::path;
use crate::types::Item;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A resolved field: either a node of the raw tree or one of the canonical
/// item fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<'a> {
    Value(&'a Value),
    Text(&'a str),
    Instant(DateTime<Utc>),
}

impl Field<'_> {
    pub fn to_text(&self) -> String {
        match self {
            Field::Value(v) => path::value_text(v),
            Field::Text(s) => s.to_string(),
            Field::Instant(t) => t.to_rfc3339(),
        }
    }
}

impl Item {
    /// Resolves a dotted path. The raw tree is tried at the full path and
    /// then with a leading `raw.` stripped; canonical fields come last.
    /// Blank values count as missing.
    pub fn lookup(&self, field_path: &str) -> Option<Field<'_>> {
        let field_path = field_path.trim();
        if field_path.is_empty() {
            return None;
        }

        let raw_hit = path::resolve(&self.raw, field_path)
            .or_else(|| {
                field_path
                    .strip_prefix("raw.")
                    .and_then(|rest| path::resolve(&self.raw, rest))
            })
            .filter(|v| !path::is_blank(v));
        if let Some(value) = raw_hit {
            return Some(Field::Value(value));
        }

        let text = match field_path {
            "id" => self.id.as_str(),
            "title" => self.title.as_str(),
            "body" | "description" => self.body.as_str(),
            "link" | "url" => self.link.as_str(),
            "timestamp" | "published" | "date" => {
                return self.timestamp.map(Field::Instant);
            }
            _ => return None,
        };
        if text.is_empty() {
            None
        } else {
            Some(Field::Text(text))
        }
    }

    /// Stringified field value; missing paths give an empty string.
    pub fn field_text(&self, field_path: &str) -> String {
        self.lookup(field_path)
            .map(|f| f.to_text())
            .unwrap_or_default()
    }
}
