//! Application use cases: ingest one log payload, list stored records.
//!
//! [`IngestError`] tags failures so the caller can pick a policy:
//! validation failures are never worth retrying, persistence failures are.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::record::{LogMessage, LogRecord, Severity};
use crate::store::{ListQuery, LogStore, StoreError};

/// Errors from ingesting a delivery payload.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Malformed payload; retrying can never succeed.
    #[error("invalid log payload: {0}")]
    Validation(String),

    /// Store unavailable; the caller decides whether to requeue.
    #[error("failed to persist log record: {0}")]
    Persistence(#[from] StoreError),
}

/// Validates a delivery payload and persists it as a [`LogRecord`].
pub struct IngestLogUseCase {
    store: Arc<dyn LogStore>,
}

impl IngestLogUseCase {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    /// Decode, validate, timestamp and persist one payload.
    ///
    /// The timestamp is assigned at ingestion when the producer omitted
    /// one. An unrecognized level becomes [`Severity::Unknown`] rather
    /// than a validation failure.
    pub async fn execute(&self, payload: &[u8]) -> Result<LogRecord, IngestError> {
        let message: LogMessage = serde_json::from_slice(payload)
            .map_err(|e| IngestError::Validation(format!("malformed JSON: {}", e)))?;

        if message.message.trim().is_empty() {
            return Err(IngestError::Validation(
                "message must not be empty".to_string(),
            ));
        }
        if message.level.trim().is_empty() {
            return Err(IngestError::Validation(
                "level must not be empty".to_string(),
            ));
        }

        let record = LogRecord {
            level: Severity::from(message.level.as_str()),
            message: message.message,
            timestamp: message.timestamp.unwrap_or_else(Utc::now),
            source: message.source,
        };

        self.store.insert(&record).await?;

        debug!(
            level = %record.level,
            source = ?record.source,
            "Log record persisted"
        );
        Ok(record)
    }
}

/// Lists stored records, most-recent-first.
pub struct ListLogsUseCase {
    store: Arc<dyn LogStore>,
}

impl ListLogsUseCase {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    /// List up to `limit` records (server default and cap applied).
    pub async fn execute(&self, limit: Option<u32>) -> Result<Vec<LogRecord>, StoreError> {
        self.store.list(ListQuery { limit }).await
    }
}
