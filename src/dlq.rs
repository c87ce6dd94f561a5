//! Dead letter queue for unprocessable payloads.
//!
//! Payloads that fail validation, or keep failing persistence past the
//! retry cap, are pushed here instead of being discarded or retried
//! forever. Entries land on a capped Redis stream for manual inspection.

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use thiserror::Error;
use tracing::{error, info};

/// Redis stream name for the dead letter queue
pub const DLQ_STREAM_NAME: &str = "loghive:logs:dlq";

/// Maximum entries to keep (older entries are trimmed)
const DLQ_MAX_LEN: usize = 10_000;

/// Errors from the dead letter queue.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),
}

/// Sink for payloads the consumer loop gives up on.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record an unprocessable payload for later inspection.
    async fn push(&self, payload: &[u8], error: &str, retry_count: u32) -> Result<(), DlqError>;
}

/// Redis-backed dead letter queue.
#[derive(Clone)]
pub struct RedisDeadLetterQueue {
    pool: Pool,
}

impl RedisDeadLetterQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterQueue {
    async fn push(&self, payload: &[u8], error: &str, retry_count: u32) -> Result<(), DlqError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for DLQ");
            DlqError::Connection(e.to_string())
        })?;

        let failed_at = chrono::Utc::now().to_rfc3339();

        // MAXLEN ~ keeps the stream from growing without bound
        let mut add = cmd("XADD");
        add.arg(DLQ_STREAM_NAME)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*");
        for (key, value) in entry_fields(payload, error, retry_count, &failed_at) {
            add.arg(key).arg(value);
        }

        let id: String = add.query_async(&mut conn).await.map_err(|e| {
            error!(error = %e, "Failed to add payload to DLQ");
            DlqError::Command(e.to_string())
        })?;

        info!(
            dlq_id = %id,
            error = %error,
            retry_count = retry_count,
            "Payload moved to dead letter queue"
        );

        Ok(())
    }
}

/// Fields stored with a dead-lettered payload.
fn entry_fields(
    payload: &[u8],
    error: &str,
    retry_count: u32,
    failed_at: &str,
) -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("payload", payload.to_vec()),
        ("error", error.as_bytes().to_vec()),
        ("retryCount", retry_count.to_string().into_bytes()),
        ("failedAt", failed_at.as_bytes().to_vec()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_stream_name() {
        assert_eq!(DLQ_STREAM_NAME, "loghive:logs:dlq");
    }

    #[test]
    fn test_entry_field_names_and_order() {
        let fields = entry_fields(b"{\"level\":\"info\"}", "store unavailable", 3, "2026-08-29T00:00:00+00:00");

        let names: Vec<&str> = fields.iter().map(|(key, _)| *key).collect();
        assert_eq!(names, vec!["payload", "error", "retryCount", "failedAt"]);
    }

    #[test]
    fn test_entry_field_encodings() {
        let payload = b"\x00binary\xffpayload";
        let fields = entry_fields(payload, "parse failure", 2, "2026-08-29T12:34:56+00:00");

        // Raw payload bytes are preserved as-is
        assert_eq!(fields[0].1, payload.to_vec());
        assert_eq!(fields[1].1, b"parse failure".to_vec());
        // Retry count is stored as decimal text so it is readable with XRANGE
        assert_eq!(fields[2].1, b"2".to_vec());
        assert_eq!(fields[3].1, b"2026-08-29T12:34:56+00:00".to_vec());
    }
}
