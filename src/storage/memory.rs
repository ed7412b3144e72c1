use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{StorageError, UsageRecord, UsageStorage};

/// In-process storage. Every operation runs under a single lock acquisition.
pub struct MemoryStorage {
    records: Mutex<Option<HashMap<String, UsageRecord>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Store a record verbatim, including an unreadable `last_reset`.
    #[cfg(test)]
    pub async fn insert_raw(&self, client_key: &str, record: UsageRecord) {
        if let Some(records) = self.records.lock().await.as_mut() {
            records.insert(client_key.to_string(), record);
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageStorage for MemoryStorage {
    async fn get_usage(&self, client_key: &str) -> Result<Option<UsageRecord>, StorageError> {
        let guard = self.records.lock().await;
        let records = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(records.get(client_key).cloned())
    }

    async fn set_usage(
        &self,
        client_key: &str,
        period_tokens: u64,
        total_tokens: u64,
        last_reset: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut guard = self.records.lock().await;
        let records = guard.as_mut().ok_or(StorageError::Closed)?;
        records.insert(
            client_key.to_string(),
            UsageRecord {
                period_tokens,
                total_tokens,
                last_reset: Some(last_reset),
            },
        );
        Ok(())
    }

    async fn increment_tokens(&self, client_key: &str, amount: u64) -> Result<(), StorageError> {
        let mut guard = self.records.lock().await;
        let records = guard.as_mut().ok_or(StorageError::Closed)?;
        let record = records
            .entry(client_key.to_string())
            .or_insert_with(|| UsageRecord {
                period_tokens: 0,
                total_tokens: 0,
                last_reset: Some(Utc::now()),
            });
        record.period_tokens = record.period_tokens.saturating_add(amount);
        record.total_tokens = record.total_tokens.saturating_add(amount);
        Ok(())
    }

    async fn reset_usage(&self, client_key: &str) -> Result<(), StorageError> {
        let mut guard = self.records.lock().await;
        let records = guard.as_mut().ok_or(StorageError::Closed)?;
        let record = records
            .entry(client_key.to_string())
            .or_insert_with(|| UsageRecord {
                period_tokens: 0,
                total_tokens: 0,
                last_reset: None,
            });
        record.period_tokens = 0;
        record.last_reset = Some(Utc::now());
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.records.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[tokio::test]
    async fn test_missing_key_is_absent() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_usage("10.0.0.1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_creates_then_adds() {
        let storage = MemoryStorage::new();
        let before = Utc::now();
        storage.increment_tokens("10.0.0.1", 25).await.unwrap();
        storage.increment_tokens("10.0.0.1", 5).await.unwrap();

        let record = storage.get_usage("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(record.period_tokens, 30);
        assert_eq!(record.total_tokens, 30);
        assert!(record.last_reset.unwrap() >= before);
    }

    #[tokio::test]
    async fn test_reset_keeps_total() {
        let storage = MemoryStorage::new();
        let old = Utc::now() - TimeDelta::hours(30);
        storage.set_usage("10.0.0.1", 80, 500, old).await.unwrap();

        storage.reset_usage("10.0.0.1").await.unwrap();
        let record = storage.get_usage("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(record.period_tokens, 0);
        assert_eq!(record.total_tokens, 500);
        assert!(record.last_reset.unwrap() > old);
    }

    #[tokio::test]
    async fn test_reset_creates_missing_record() {
        let storage = MemoryStorage::new();
        storage.reset_usage("10.0.0.2").await.unwrap();
        let record = storage.get_usage("10.0.0.2").await.unwrap().unwrap();
        assert_eq!(record.period_tokens, 0);
        assert_eq!(record.total_tokens, 0);
        assert!(record.last_reset.is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let storage = MemoryStorage::new();
        storage.close().await.unwrap();
        storage.close().await.unwrap();
        assert!(matches!(
            storage.get_usage("10.0.0.1").await,
            Err(StorageError::Closed)
        ));
    }
}
