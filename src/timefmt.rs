//! Protocol timestamp parsing and display formatting.
//!
//! The wire protocol carries send and delivery times as plain
//! `YYYY-MM-DD HH:MM:SS` strings in UTC.  Parsing is expensive enough (and
//! frequent enough on list screens) that every stored message carries three
//! redundant encodings computed once at write time: the raw protocol string,
//! the epoch-milliseconds integer, and a human-readable display string.
//! [`DerivedTimestamps`] is that triple.
//!
//! Two display formats exist: the compact one shown next to a message bubble
//! and the longer one shown on the chat list row.  Which one applies is the
//! caller's choice, so formatters are passed around as plain function values.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Wire format for `sent_at` / `time` fields.
pub const PROTOCOL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A display formatter applied to a parsed protocol timestamp.
pub type TimestampFormatter = fn(DateTime<Utc>) -> String;

#[derive(Debug)]
pub enum TimeError {
    /// The raw string did not match [`PROTOCOL_TIME_FORMAT`].
    Unparseable(String),
}

impl std::fmt::Display for TimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeError::Unparseable(raw) => write!(f, "unparseable timestamp: {raw:?}"),
        }
    }
}

impl std::error::Error for TimeError {}

/// Parse a raw protocol timestamp string (UTC).
pub fn parse_protocol_timestamp(raw: &str) -> Result<DateTime<Utc>, TimeError> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), PROTOCOL_TIME_FORMAT)
        .map_err(|_| TimeError::Unparseable(raw.to_string()))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Render the current wall-clock time in the wire format.
pub fn now_protocol_timestamp() -> String {
    Utc::now().format(PROTOCOL_TIME_FORMAT).to_string()
}

/// Chat-list row format, e.g. `Aug 29, 14:02`.
pub fn thread_format(t: DateTime<Utc>) -> String {
    t.format("%b %e, %H:%M").to_string()
}

/// Message-bubble format, e.g. `14:02`.
pub fn message_format(t: DateTime<Utc>) -> String {
    t.format("%H:%M").to_string()
}

/// The redundant timestamp triple stored on every message and chat row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedTimestamps {
    /// Raw protocol string, exactly as received/sent.
    pub raw: String,
    /// Milliseconds since the Unix epoch.
    pub epoch_ms: i64,
    /// Human-readable form, produced by the supplied formatter.
    pub display: String,
}

impl DerivedTimestamps {
    /// Parse `raw` and derive the triple using `format`.
    ///
    /// Fails only if `raw` does not parse; the caller decides whether that
    /// aborts the enclosing operation (pipeline tasks) or skips a row
    /// (migrations).
    pub fn derive(raw: &str, format: TimestampFormatter) -> Result<Self, TimeError> {
        let parsed = parse_protocol_timestamp(raw)?;
        Ok(Self {
            raw: raw.trim().to_string(),
            epoch_ms: parsed.timestamp_millis(),
            display: format(parsed),
        })
    }
}
