//! Persistence port for per-client usage records.
//!
//! Every adapter stores one record per client key and must apply
//! [`UsageStorage::increment_tokens`] as a single atomic operation on the
//! backing store, so concurrent reports for the same client never lose updates.

pub mod memory;
pub mod mongo;
pub mod sql;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::StorageConfig;

pub use memory::MemoryStorage;
pub use mongo::MongoStorage;
pub use sql::TursoStorage;

/// Default collection/table name for usage records
pub const DEFAULT_COLLECTION: &str = "usage_tracking";

/// Stored usage for a single client key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    /// Tokens consumed since `last_reset`
    pub period_tokens: u64,
    /// Lifetime tokens, never reset
    pub total_tokens: u64,
    /// Start of the current period. `None` when the stored value is not a valid instant.
    pub last_reset: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage connection failed: {0}")]
    Connection(String),

    #[error("Storage query failed: {0}")]
    Query(String),

    #[error("Storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage is closed")]
    Closed,
}

#[async_trait]
pub trait UsageStorage: Send + Sync {
    /// Fetch the record for `client_key`. A missing record is `Ok(None)`, not an error.
    async fn get_usage(&self, client_key: &str) -> Result<Option<UsageRecord>, StorageError>;

    /// Upsert the full record, overwriting every field.
    async fn set_usage(
        &self,
        client_key: &str,
        period_tokens: u64,
        total_tokens: u64,
        last_reset: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Atomically add `amount` to both counters, creating the record
    /// (`last_reset = now`) if it does not exist.
    async fn increment_tokens(&self, client_key: &str, amount: u64) -> Result<(), StorageError>;

    /// Zero the period counter and move `last_reset` to now. Lifetime total is kept.
    async fn reset_usage(&self, client_key: &str) -> Result<(), StorageError>;

    /// Release connection resources. Calling it more than once is a no-op.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Open the configured backend once, before the server starts accepting requests.
pub async fn connect(
    config: &StorageConfig,
    timeout: Duration,
) -> Result<Arc<dyn UsageStorage>, StorageError> {
    let storage: Arc<dyn UsageStorage> = match config {
        StorageConfig::MongoDb {
            url,
            database,
            collection,
        } => Arc::new(MongoStorage::connect(url, database, collection, timeout).await?),
        StorageConfig::Turso { path, table } => Arc::new(TursoStorage::open(path, table).await?),
        StorageConfig::Memory => {
            warn!("Using in-memory usage storage; usage is lost on restart");
            Arc::new(MemoryStorage::new())
        }
    };
    Ok(storage)
}

/// Parse a persisted RFC 3339 timestamp, yielding `None` for anything unreadable.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Clamp a stored signed counter to the unsigned domain.
pub(crate) fn counter_from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Counters are stored as signed 64-bit integers by every backend.
pub(crate) fn counter_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
