//! # loghive
//!
//! A log ingestion service fed by a message queue.
//!
//! ## Architecture
//!
//! ```text
//! Producer -> Redis Stream -> Consumer Loop -> Ingestion -> PostgreSQL
//!                                                               ^
//!                                               HTTP GET /logs -+
//! ```
//!
//! The consumer loop pulls deliveries one at a time, persists each as a
//! [`LogRecord`] and acknowledges only on success. On SIGINT/SIGTERM the
//! [`shutdown::ShutdownCoordinator`] cancels the subscription and waits a
//! bounded window for in-flight work to drain before the process exits.
//!
//! ## Modules
//!
//! - [`record`]: log record and wire payload types
//! - [`queue`]: queue client (deliveries, subscriptions, acknowledgement)
//! - [`consumer`]: the sequential pull/ingest/ack loop
//! - [`shutdown`]: termination signal handling and the bounded drain

pub mod config;
pub mod consumer;
pub mod dlq;
pub mod http;
pub mod queue;
pub mod record;
pub mod shutdown;
pub mod store;
pub mod usecase;

// Re-export commonly used types at crate root
pub use record::{LogRecord, Severity};
pub use store::LogStore;

/// Redis stream name that log payloads are published to
pub const LOG_STREAM_NAME: &str = "loghive:logs";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "loghive_ingest";
