use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tracing::info;
use turso::{Builder, Connection, Database};

use super::{StorageError, UsageRecord, UsageStorage, counter_from_i64, counter_to_i64};

/// Embedded SQL storage on a single long-lived turso connection.
pub struct TursoStorage {
    table: String,
    conn: Mutex<Option<Connection>>,
    _db: Database,
}

fn valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn query_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Query(e.to_string())
}

impl TursoStorage {
    /// Open (or create) the database file and ensure the usage table exists.
    pub async fn open(path: &Path, table: &str) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Connection(format!("Failed to create DB directory: {e}"))
            })?;
        }
        let storage = Self::open_location(&path.to_string_lossy(), table).await?;
        info!("Usage database opened at {}", path.display());
        Ok(storage)
    }

    /// Non-persistent database, used by tests.
    #[cfg(test)]
    pub async fn open_in_memory(table: &str) -> Result<Self, StorageError> {
        Self::open_location(":memory:", table).await
    }

    async fn open_location(location: &str, table: &str) -> Result<Self, StorageError> {
        if !valid_table_name(table) {
            return Err(StorageError::Connection(format!(
                "Invalid table name: {table}"
            )));
        }

        let db = Builder::new_local(location)
            .build()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StorageError::Connection(format!("Failed to connect: {e}")))?;

        conn.execute(
            &format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    client_key TEXT PRIMARY KEY,
                    period_tokens INTEGER NOT NULL DEFAULT 0,
                    total_tokens INTEGER NOT NULL DEFAULT 0,
                    last_reset TEXT NOT NULL
                )
                "#
            ),
            (),
        )
        .await
        .map_err(|e| StorageError::Connection(format!("Failed to create {table} table: {e}")))?;

        Ok(Self {
            table: table.to_string(),
            conn: Mutex::new(Some(conn)),
            _db: db,
        })
    }
}

#[async_trait]
impl UsageStorage for TursoStorage {
    async fn get_usage(&self, client_key: &str) -> Result<Option<UsageRecord>, StorageError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        let mut rows = conn
            .query(
                &format!(
                    "SELECT period_tokens, total_tokens, last_reset FROM {} WHERE client_key = ?",
                    self.table
                ),
                [client_key],
            )
            .await
            .map_err(query_error)?;

        let Some(row) = rows.next().await.map_err(query_error)? else {
            return Ok(None);
        };

        Ok(Some(UsageRecord {
            period_tokens: counter_from_i64(row.get::<i64>(0).unwrap_or(0)),
            total_tokens: counter_from_i64(row.get::<i64>(1).unwrap_or(0)),
            last_reset: row
                .get::<String>(2)
                .ok()
                .and_then(|raw| super::parse_timestamp(&raw)),
        }))
    }

    async fn set_usage(
        &self,
        client_key: &str,
        period_tokens: u64,
        total_tokens: u64,
        last_reset: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        conn.execute(
            &format!(
                "INSERT INTO {} (client_key, period_tokens, total_tokens, last_reset) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(client_key) DO UPDATE SET \
                 period_tokens = excluded.period_tokens, \
                 total_tokens = excluded.total_tokens, \
                 last_reset = excluded.last_reset",
                self.table
            ),
            (
                client_key,
                counter_to_i64(period_tokens),
                counter_to_i64(total_tokens),
                format_timestamp(last_reset),
            ),
        )
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn increment_tokens(&self, client_key: &str, amount: u64) -> Result<(), StorageError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        conn.execute(
            &format!(
                "INSERT INTO {} (client_key, period_tokens, total_tokens, last_reset) VALUES (?1, ?2, ?2, ?3) \
                 ON CONFLICT(client_key) DO UPDATE SET \
                 period_tokens = period_tokens + excluded.period_tokens, \
                 total_tokens = total_tokens + excluded.total_tokens",
                self.table
            ),
            (
                client_key,
                counter_to_i64(amount),
                format_timestamp(Utc::now()),
            ),
        )
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn reset_usage(&self, client_key: &str) -> Result<(), StorageError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        conn.execute(
            &format!(
                "INSERT INTO {} (client_key, period_tokens, total_tokens, last_reset) VALUES (?1, 0, 0, ?2) \
                 ON CONFLICT(client_key) DO UPDATE SET \
                 period_tokens = 0, \
                 last_reset = excluded.last_reset",
                self.table
            ),
            (client_key, format_timestamp(Utc::now())),
        )
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.conn.lock().await.take().is_some() {
            info!("Closed usage database connection");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    async fn storage() -> TursoStorage {
        TursoStorage::open_in_memory("usage_tracking").await.unwrap()
    }

    #[test]
    fn test_valid_table_name() {
        assert!(valid_table_name("usage_tracking"));
        assert!(valid_table_name("Usage2"));
        assert!(!valid_table_name(""));
        assert!(!valid_table_name("2usage"));
        assert!(!valid_table_name("usage; DROP TABLE x"));
    }

    #[tokio::test]
    async fn test_invalid_table_name_rejected() {
        let result = TursoStorage::open_in_memory("bad name").await;
        assert!(matches!(result, Err(StorageError::Connection(_))));
    }

    #[tokio::test]
    async fn test_missing_key_is_absent() {
        let storage = storage().await;
        assert_eq!(storage.get_usage("1.2.3.4").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_upserts() {
        let storage = storage().await;
        storage.increment_tokens("1.2.3.4", 60).await.unwrap();
        storage.increment_tokens("1.2.3.4", 50).await.unwrap();

        let record = storage.get_usage("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(record.period_tokens, 110);
        assert_eq!(record.total_tokens, 110);
        assert!(record.last_reset.is_some());
    }

    #[tokio::test]
    async fn test_set_then_reset() {
        let storage = storage().await;
        let old = Utc::now() - TimeDelta::hours(48);
        storage.set_usage("1.2.3.4", 100, 900, old).await.unwrap();

        let record = storage.get_usage("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(record.period_tokens, 100);
        assert_eq!(record.total_tokens, 900);
        assert_eq!(
            record.last_reset.unwrap().timestamp_micros(),
            old.timestamp_micros()
        );

        storage.reset_usage("1.2.3.4").await.unwrap();
        storage.reset_usage("1.2.3.4").await.unwrap();
        let record = storage.get_usage("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(record.period_tokens, 0);
        assert_eq!(record.total_tokens, 900);
        assert!(record.last_reset.unwrap() > old);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let storage = storage().await;
        storage.close().await.unwrap();
        storage.close().await.unwrap();
        assert!(matches!(
            storage.increment_tokens("1.2.3.4", 1).await,
            Err(StorageError::Closed)
        ));
    }
}
