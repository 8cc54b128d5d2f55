//! Document-store seam shared by lead sources and the central store.
//!
//! Every backend offers the same four operations: a typed inclusive range
//! query, an existence check, an atomic create-if-absent and an append with a
//! store-assigned id. Backends: in-memory, Firestore REST and Postgres JSONB.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use leadsync_core::{Document, TimestampBound};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

mod firestore;
mod postgres;

pub use firestore::{AccessToken, FirestoreConfig, FirestoreStore};
pub use postgres::PgDocumentStore;

pub const CRATE_NAME: &str = "leadsync-storage";

/// Coarse failure classes; sources map these onto their own error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The store could not be reached or is overloaded.
    Unavailable,
    /// The store answered and refused the request.
    Rejected,
}

pub fn classify_status(status: StatusCode) -> FailureClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FailureClass::Unavailable
    } else {
        FailureClass::Rejected
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> FailureClass {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        FailureClass::Unavailable
    } else {
        FailureClass::Rejected
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> FailureClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => FailureClass::Unavailable,
        _ => FailureClass::Rejected,
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed document {name}: {reason}")]
    Malformed { name: String, reason: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("credentials unavailable: {0}")]
    Credentials(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn class(&self) -> FailureClass {
        match self {
            StoreError::Request(err) => classify_reqwest_error(err),
            StoreError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(FailureClass::Rejected),
            StoreError::Database(err) => classify_sqlx_error(err),
            StoreError::Malformed { .. }
            | StoreError::InvalidUrl { .. }
            | StoreError::Credentials(_) => FailureClass::Rejected,
            StoreError::Unavailable(_) => FailureClass::Unavailable,
        }
    }
}

/// A document as returned by a query, keyed by its store id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub fields: Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short human-readable target, used in log lines.
    fn describe(&self) -> String;

    /// Every document in `collection` whose `field` is at or after `bound`.
    async fn query_at_or_after(
        &self,
        collection: &str,
        field: &str,
        bound: TimestampBound,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    async fn exists(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    /// Creates `id` only if no document with that id exists. Never overwrites.
    async fn create_if_absent(
        &self,
        collection: &str,
        id: &str,
        document: &Document,
    ) -> Result<CreateOutcome, StoreError>;

    /// Creates a document under a store-assigned id and returns that id.
    async fn append(&self, collection: &str, document: &Document) -> Result<String, StoreError>;
}

type Collections = BTreeMap<String, BTreeMap<String, Document>>;

/// Process-local store. Clones share the same underlying collections.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    name: String,
    collections: Arc<Mutex<Collections>>,
}

impl MemoryDocumentStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: Arc::default(),
        }
    }

    /// Inserts or replaces a document; for seeding fixtures.
    pub async fn insert(&self, collection: &str, id: &str, document: Document) {
        let mut collections = self.collections.lock().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
    }

    pub async fn get(&self, collection: &str, id: &str) -> Option<Document> {
        let collections = self.collections.lock().await;
        collections.get(collection).and_then(|docs| docs.get(id)).cloned()
    }

    pub async fn documents(&self, collection: &str) -> Vec<StoredDocument> {
        let collections = self.collections.lock().await;
        collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| StoredDocument {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn count(&self, collection: &str) -> usize {
        let collections = self.collections.lock().await;
        collections.get(collection).map(BTreeMap::len).unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn query_at_or_after(
        &self,
        collection: &str,
        field: &str,
        bound: TimestampBound,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let collections = self.collections.lock().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(_, fields)| {
                fields
                    .get(field)
                    .map(|value| value.at_or_after(&bound))
                    .unwrap_or(false)
            })
            .map(|(id, fields)| StoredDocument {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect())
    }

    async fn exists(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .map(|docs| docs.contains_key(id))
            .unwrap_or(false))
    }

    async fn create_if_absent(
        &self,
        collection: &str,
        id: &str,
        document: &Document,
    ) -> Result<CreateOutcome, StoreError> {
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        docs.insert(id.to_string(), document.clone());
        Ok(CreateOutcome::Created)
    }

    async fn append(&self, collection: &str, document: &Document) -> Result<String, StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        let mut collections = self.collections.lock().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), document.clone());
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use leadsync_core::{FieldValue, TimestampKind};

    fn midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).single().unwrap()
    }

    fn doc(field: &str, value: FieldValue) -> Document {
        Document::from([(field.to_string(), value)])
    }

    #[tokio::test]
    async fn memory_create_if_absent_never_overwrites() {
        let store = MemoryDocumentStore::new("central");
        let first = doc("name", "first".into());
        let second = doc("name", "second".into());

        let a = store.create_if_absent("leads", "ama_1", &first).await.unwrap();
        let b = store.create_if_absent("leads", "ama_1", &second).await.unwrap();

        assert_eq!(a, CreateOutcome::Created);
        assert_eq!(b, CreateOutcome::AlreadyExists);
        assert_eq!(store.get("leads", "ama_1").await, Some(first));
        assert!(store.exists("leads", "ama_1").await.unwrap());
        assert!(!store.exists("leads", "ama_2").await.unwrap());
    }

    #[tokio::test]
    async fn memory_range_query_respects_value_types() {
        let store = MemoryDocumentStore::new("source");
        let cutoff = midnight();
        let ms = cutoff.timestamp_millis();
        store.insert("leads", "at", doc("created", FieldValue::Integer(ms))).await;
        store.insert("leads", "before", doc("created", FieldValue::Integer(ms - 1))).await;
        store.insert("leads", "typed", doc("created", FieldValue::Timestamp(cutoff))).await;
        store.insert("leads", "missing", doc("other", FieldValue::Integer(ms))).await;

        let hits = store
            .query_at_or_after("leads", "created", TimestampKind::EpochMillis.bound_for(cutoff))
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["at"]);

        let hits = store
            .query_at_or_after("leads", "created", TimestampKind::NativeTimestamp.bound_for(cutoff))
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["typed"]);
    }

    #[tokio::test]
    async fn memory_append_assigns_distinct_ids() {
        let store = MemoryDocumentStore::new("central");
        let a = store.append("sync_logs", &doc("n", FieldValue::Integer(1))).await.unwrap();
        let b = store.append("sync_logs", &doc("n", FieldValue::Integer(1))).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.count("sync_logs").await, 2);
    }

    #[test]
    fn status_classification_separates_outages_from_rejections() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), FailureClass::Unavailable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureClass::Unavailable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), FailureClass::Rejected);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), FailureClass::Rejected);

        let err = StoreError::HttpStatus {
            status: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(err.class(), FailureClass::Unavailable);
        assert_eq!(StoreError::Database(sqlx::Error::PoolTimedOut).class(), FailureClass::Unavailable);
        assert_eq!(StoreError::Database(sqlx::Error::RowNotFound).class(), FailureClass::Rejected);
    }
}
