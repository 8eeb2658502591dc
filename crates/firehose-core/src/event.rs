//! Stream records and their decoding.
//!
//! The upstream feed delivers one JSON object per line:
//!
//! ```text
//! {"data": {"id": "...", "text": "...", "author_id": "..."},
//!  "includes": {"users": [{"id": "...", "username": "...", "name": "..."}]}}
//! ```
//!
//! [`decode_line`] classifies each raw line as either an [`Event`] or a
//! [`SkipReason`]. Keep-alive newlines and malformed fragments are expected
//! noise on the wire and never surface as errors.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::{Map, Value};

/// A decoded record from the upstream feed.
///
/// Holds the full JSON object as received. Accessors read from the `data`
/// object and from the author sub-record (`includes.users[0]`); any of
/// them may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    record: Map<String, Value>,
}

impl Event {
    /// Parse a JSON object into an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON or is valid JSON but not
    /// an object.
    pub fn from_json(text: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(record) => Ok(Self { record }),
            other => Err(Error::InvalidRecord(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// The `data` object carrying the primary record fields.
    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.record.get("data").and_then(Value::as_object)
    }

    /// The author sub-record: the first entry of `includes.users`.
    pub fn author(&self) -> Option<&Map<String, Value>> {
        self.record
            .get("includes")?
            .get("users")?
            .as_array()?
            .first()?
            .as_object()
    }

    /// Record ID.
    pub fn id(&self) -> Option<String> {
        self.data_field("id")
    }

    /// Record text.
    pub fn text(&self) -> Option<String> {
        self.data_field("text")
    }

    /// ID of the authoring user.
    pub fn author_id(&self) -> Option<String> {
        self.data_field("author_id")
    }

    /// Creation timestamp as sent upstream (RFC 3339).
    pub fn created_at(&self) -> Option<String> {
        self.data_field("created_at")
    }

    /// Detected language code.
    pub fn lang(&self) -> Option<String> {
        self.data_field("lang")
    }

    /// Author handle.
    pub fn username(&self) -> Option<String> {
        self.author_field("username")
    }

    /// Author display name.
    pub fn display_name(&self) -> Option<String> {
        self.author_field("name")
    }

    /// Serialize the full record back to JSON bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.record)?)
    }

    fn data_field(&self, name: &str) -> Option<String> {
        self.data()?.get(name).and_then(field_text)
    }

    fn author_field(&self, name: &str) -> Option<String> {
        self.author()?.get(name).and_then(field_text)
    }
}

/// Why a line produced no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Empty or whitespace-only line (stream keep-alive).
    Blank,
    /// Not a JSON object.
    Malformed,
}

impl SkipReason {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blank => "blank",
            Self::Malformed => "malformed",
        }
    }
}

/// Outcome of decoding one raw line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The line held a record.
    Event(Event),
    /// The line is discarded.
    Skip(SkipReason),
}

/// Decode one raw line from the feed.
///
/// Never fails: anything that does not parse as a JSON object is skipped.
pub fn decode_line(line: &str) -> Decoded {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Decoded::Skip(SkipReason::Blank);
    }

    match Event::from_json(trimmed) {
        Ok(event) => Decoded::Event(event),
        Err(e) => {
            tracing::debug!("Skipping malformed line: {}", e);
            Decoded::Skip(SkipReason::Malformed)
        }
    }
}

/// Flat projection of an [`Event`] written to batch files.
///
/// Every column is nullable; missing source fields become `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventRow {
    pub id: Option<String>,
    pub text: Option<String>,
    pub author_id: Option<String>,
    pub created_at: Option<String>,
    pub lang: Option<String>,
    pub user_username: Option<String>,
    pub user_name: Option<String>,
}

impl EventRow {
    /// Column names in file order.
    pub const COLUMNS: [&'static str; 7] = [
        "id",
        "text",
        "author_id",
        "created_at",
        "lang",
        "user_username",
        "user_name",
    ];
}

impl From<&Event> for EventRow {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id(),
            text: event.text(),
            author_id: event.author_id(),
            created_at: event.created_at(),
            lang: event.lang(),
            user_username: event.username(),
            user_name: event.display_name(),
        }
    }
}

/// Render a JSON value as column text. Strings are taken verbatim, other
/// scalars and containers as their JSON form, null as missing.
fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
