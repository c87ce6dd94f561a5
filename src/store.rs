//! Persistence for log records.
//!
//! The [`LogStore`] trait is the seam between the use cases and the
//! database; the production implementation is [`PgLogStore`] on sqlx /
//! PostgreSQL. Records are insert-only: there is no update path.
//!
//! Listing returns records most-recent-first (`timestamp DESC, id DESC`);
//! the tiebreak on `id` keeps the order stable when two records carry the
//! same timestamp.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;

use crate::record::{LogRecord, Severity};

/// Limit applied when the caller does not send one.
pub const DEFAULT_LIST_LIMIT: u32 = 100;

/// Hard cap on a single listing, whatever the caller asks for.
pub const MAX_LIST_LIMIT: u32 = 1000;

/// Errors from the persistence store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Parameters for a listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListQuery {
    /// Maximum number of records to return
    pub limit: Option<u32>,
}

impl ListQuery {
    /// The limit actually applied: the default when absent, clamped to the cap.
    pub fn effective_limit(&self) -> i64 {
        i64::from(self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT))
    }
}

/// Store seam used by the ingestion and listing use cases.
///
/// Implementations must be safe for concurrent use: the consumer loop and
/// every HTTP request handler share one store.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persist one record.
    async fn insert(&self, record: &LogRecord) -> Result<(), StoreError>;

    /// List records, most-recent-first.
    async fn list(&self, query: ListQuery) -> Result<Vec<LogRecord>, StoreError>;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS logs (
    id BIGSERIAL PRIMARY KEY,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    source TEXT,
    timestamp TIMESTAMPTZ NOT NULL
)";

/// PostgreSQL-backed log store.
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    /// Connect to the database and ensure the schema exists.
    ///
    /// Failure here is a fatal startup error for the service.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn insert(&self, record: &LogRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO logs (level, message, source, timestamp) VALUES ($1, $2, $3, $4)")
            .bind(record.level.as_str())
            .bind(&record.message)
            .bind(record.source.as_deref())
            .bind(record.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, query: ListQuery) -> Result<Vec<LogRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT level, message, source, timestamp FROM logs \
             ORDER BY timestamp DESC, id DESC LIMIT $1",
        )
        .bind(query.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(records)
    }
}

fn row_to_record(row: &PgRow) -> Result<LogRecord, sqlx::Error> {
    let level: String = row.try_get("level")?;
    Ok(LogRecord {
        level: Severity::from(level.as_str()),
        message: row.try_get("message")?,
        source: row.try_get("source")?,
        timestamp: row.try_get("timestamp")?,
    })
}
