use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, DateTime as BsonDateTime, Document, doc};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use tokio::sync::RwLock;
use tracing::info;

use super::{StorageError, UsageRecord, UsageStorage, counter_from_i64, counter_to_i64};

const APP_NAME: &str = "realtime-broker";

struct Session {
    client: Client,
    collection: Collection<Document>,
}

/// MongoDB-backed storage: one document per client key, keyed by `_id`.
pub struct MongoStorage {
    database: String,
    session: RwLock<Option<Session>>,
}

impl MongoStorage {
    /// Connect and ping the server. Any failure here is fatal for startup.
    pub async fn connect(
        url: &str,
        database: &str,
        collection: &str,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let mut options = ClientOptions::parse(url)
            .await
            .map_err(|e| StorageError::Connection(format!("Invalid MongoDB URL: {e}")))?;
        options.app_name = Some(APP_NAME.to_string());
        options.server_selection_timeout = Some(timeout);
        options.connect_timeout = Some(timeout);

        let client = Client::with_options(options)
            .map_err(|e| StorageError::Connection(format!("Failed to create client: {e}")))?;

        let db = client.database(database);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to reach MongoDB: {e}")))?;

        info!("Connected to MongoDB database {database} (collection {collection})");

        Ok(Self {
            database: database.to_string(),
            session: RwLock::new(Some(Session {
                collection: db.collection(collection),
                client,
            })),
        })
    }

    async fn collection(&self) -> Result<Collection<Document>, StorageError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.collection.clone())
            .ok_or(StorageError::Closed)
    }
}

fn query_error(e: mongodb::error::Error) -> StorageError {
    StorageError::Query(e.to_string())
}

fn now_bson() -> BsonDateTime {
    BsonDateTime::from_millis(Utc::now().timestamp_millis())
}

/// Counters may come back as any numeric BSON type depending on who wrote them.
fn read_counter(doc: &Document, field: &str) -> u64 {
    match doc.get(field) {
        Some(Bson::Int32(v)) => counter_from_i64(i64::from(*v)),
        Some(Bson::Int64(v)) => counter_from_i64(*v),
        Some(Bson::Double(v)) if v.is_finite() && *v > 0.0 => *v as u64,
        _ => 0,
    }
}

fn read_timestamp(doc: &Document, field: &str) -> Option<DateTime<Utc>> {
    match doc.get(field)? {
        Bson::DateTime(dt) => DateTime::from_timestamp_millis(dt.timestamp_millis()),
        Bson::String(raw) => super::parse_timestamp(raw),
        _ => None,
    }
}

fn record_from_document(doc: &Document) -> UsageRecord {
    UsageRecord {
        period_tokens: read_counter(doc, "period_tokens"),
        total_tokens: read_counter(doc, "total_tokens"),
        last_reset: read_timestamp(doc, "last_reset"),
    }
}

#[async_trait]
impl UsageStorage for MongoStorage {
    async fn get_usage(&self, client_key: &str) -> Result<Option<UsageRecord>, StorageError> {
        let collection = self.collection().await?;
        let doc = collection
            .find_one(doc! { "_id": client_key })
            .await
            .map_err(query_error)?;
        Ok(doc.as_ref().map(record_from_document))
    }

    async fn set_usage(
        &self,
        client_key: &str,
        period_tokens: u64,
        total_tokens: u64,
        last_reset: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let collection = self.collection().await?;
        collection
            .update_one(
                doc! { "_id": client_key },
                doc! {
                    "$set": {
                        "period_tokens": counter_to_i64(period_tokens),
                        "total_tokens": counter_to_i64(total_tokens),
                        "last_reset": BsonDateTime::from_millis(last_reset.timestamp_millis()),
                    }
                },
            )
            .upsert(true)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn increment_tokens(&self, client_key: &str, amount: u64) -> Result<(), StorageError> {
        let collection = self.collection().await?;
        let amount = counter_to_i64(amount);
        collection
            .update_one(
                doc! { "_id": client_key },
                doc! {
                    "$inc": { "period_tokens": amount, "total_tokens": amount },
                    "$setOnInsert": { "last_reset": now_bson() },
                },
            )
            .upsert(true)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn reset_usage(&self, client_key: &str) -> Result<(), StorageError> {
        let collection = self.collection().await?;
        collection
            .update_one(
                doc! { "_id": client_key },
                doc! {
                    "$set": { "period_tokens": 0_i64, "last_reset": now_bson() },
                    "$setOnInsert": { "total_tokens": 0_i64 },
                },
            )
            .upsert(true)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            drop(session.collection);
            session.client.shutdown().await;
            info!("Closed MongoDB connection to {}", self.database);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_document() {
        let doc = doc! {
            "_id": "1.2.3.4",
            "period_tokens": 60_i32,
            "total_tokens": 1_500_i64,
            "last_reset": BsonDateTime::from_millis(1_768_210_468_000),
        };
        let record = record_from_document(&doc);
        assert_eq!(record.period_tokens, 60);
        assert_eq!(record.total_tokens, 1_500);
        assert_eq!(record.last_reset.unwrap().timestamp(), 1_768_210_468);
    }

    #[test]
    fn test_string_timestamp_is_accepted() {
        let doc = doc! { "last_reset": "2026-01-12T09:34:28+00:00" };
        let record = record_from_document(&doc);
        assert_eq!(record.last_reset.unwrap().timestamp(), 1_768_210_468);
        assert_eq!(record.period_tokens, 0);
    }

    #[test]
    fn test_unreadable_timestamp_is_none() {
        let doc = doc! { "period_tokens": 5.0, "last_reset": "not a date" };
        let record = record_from_document(&doc);
        assert_eq!(record.period_tokens, 5);
        assert!(record.last_reset.is_none());

        let doc = doc! { "last_reset": 12_i32 };
        assert!(record_from_document(&doc).last_reset.is_none());

        let doc = doc! { "period_tokens": -3_i64 };
        let record = record_from_document(&doc);
        assert_eq!(record.period_tokens, 0);
        assert!(record.last_reset.is_none());
    }

    #[test]
    fn test_bson_roundtrip_of_now() {
        let now = Utc::now();
        let stored = Bson::DateTime(BsonDateTime::from_millis(now.timestamp_millis()));
        let doc = doc! { "last_reset": stored };
        let read = read_timestamp(&doc, "last_reset").unwrap();
        assert_eq!(read.timestamp_millis(), now.timestamp_millis());
    }
}
