//! Configuration for loghive.
//!
//! Everything is loaded from environment variables once at startup.
//!
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `REDIS_URL`: Redis connection string (required)
//! - `HTTP_ADDR`: HTTP listen address (default: `0.0.0.0:8080`)
//! - `SHUTDOWN_TIMEOUT_SECS`: bound on the graceful drain (default: 5)
//! - `LOGHIVE_CONSUMER_GROUP`: consumer group name (default: `loghive_ingest`)
//! - `LOGHIVE_CONSUMER_NAME`: unique consumer identifier (default: hostname or UUID)
//!
//! A missing required variable is a fatal startup error; the process does
//! not start degraded.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::DEFAULT_CONSUMER_GROUP;

/// Default bound on the graceful drain window, in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

/// Startup configuration, loaded once in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// HTTP listen address
    pub http_addr: String,

    /// Bound on the shutdown drain window
    pub shutdown_timeout: Duration,

    /// Consumer group the loop reads under
    pub consumer_group: String,

    /// Unique name of this consumer within the group
    pub consumer_name: String,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require("DATABASE_URL")?,
            redis_url: require("REDIS_URL")?,
            http_addr: env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr()),
            shutdown_timeout: parse_shutdown_timeout(env::var("SHUTDOWN_TIMEOUT_SECS").ok())?,
            consumer_group: env::var("LOGHIVE_CONSUMER_GROUP")
                .unwrap_or_else(|_| DEFAULT_CONSUMER_GROUP.to_string()),
            consumer_name: consumer_name(),
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn parse_shutdown_timeout(raw: Option<String>) -> Result<Duration, ConfigError> {
    match raw {
        Some(value) => {
            let secs: u64 = value.parse().map_err(|_| ConfigError::InvalidValue {
                name: "SHUTDOWN_TIMEOUT_SECS",
                value,
            })?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)),
    }
}

/// Get the consumer name from the environment or derive one.
fn consumer_name() -> String {
    if let Ok(name) = env::var("LOGHIVE_CONSUMER_NAME") {
        return name;
    }

    // Try hostname
    if let Ok(host) = hostname::get() {
        if let Some(host) = host.to_str() {
            return format!("ingester-{}", host);
        }
    }

    // Fallback to UUID
    format!("ingester-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_timeout_default() {
        let timeout = parse_shutdown_timeout(None).unwrap();
        assert_eq!(timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_shutdown_timeout_parsed() {
        let timeout = parse_shutdown_timeout(Some("30".to_string())).unwrap();
        assert_eq!(timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_shutdown_timeout_invalid() {
        let err = parse_shutdown_timeout(Some("soon".to_string())).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "SHUTDOWN_TIMEOUT_SECS",
                ..
            }
        ));
    }

    #[test]
    fn test_consumer_name_never_empty() {
        assert!(!consumer_name().is_empty());
    }
}
