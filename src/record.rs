//! Core log record types for loghive.
//!
//! A [`LogMessage`] is the wire payload carried by a queue delivery. The
//! ingestion use case validates it, assigns a timestamp when the producer
//! omitted one, and persists it as an immutable [`LogRecord`]. Persisted
//! records have no update path; they are inserted once and read back via
//! the listing use case.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log severity level.
///
/// Unrecognized levels are passed through as [`Severity::Unknown`] rather
/// than rejected, so a producer with a wider vocabulary does not get its
/// records dead-lettered over a naming gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// Catch-all for levels outside the known vocabulary
    #[serde(other)]
    Unknown,
}

impl Severity {
    /// The lowercase wire name of this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Severity {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Severity::Trace,
            "debug" => Severity::Debug,
            "info" => Severity::Info,
            "warn" => Severity::Warn,
            "error" => Severity::Error,
            _ => Severity::Unknown,
        }
    }
}

impl FromStr for Severity {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Severity::from(s))
    }
}

/// A persisted log record.
///
/// # Example
///
/// ```json
/// {
///   "level": "info",
///   "message": "user logged in",
///   "timestamp": "2026-08-29T10:00:00Z",
///   "source": "auth-service"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Severity of the record
    pub level: Severity,

    /// Log text; always non-empty once persisted
    pub message: String,

    /// When the record was emitted, or when it was ingested if the
    /// producer did not say
    pub timestamp: DateTime<Utc>,

    /// Origin system that emitted the record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The wire payload decoded from a queue delivery.
///
/// `level` stays a plain string here: the ingestion use case decides how
/// to map it. `timestamp` and `source` are optional on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    /// Severity name as sent by the producer
    pub level: String,

    /// Log text
    pub message: String,

    /// Origin system
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Producer-side timestamp; assigned at ingestion when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogMessage {
    /// Create a new message with required fields
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            message: message.into(),
            source: None,
            timestamp: None,
        }
    }

    /// Set the source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}
