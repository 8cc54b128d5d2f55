//! Source adapter contracts + the two timestamp-representation variants.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadsync_core::{RawLeadRecord, TimestampBound, TimestampKind};
use leadsync_storage::{DocumentStore, FailureClass, StoreError, StoredDocument};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "leadsync-adapters";

/// Static per-source configuration, built once at startup.
#[derive(Clone)]
pub struct SourceDescriptor {
    pub source_tag: String,
    pub display_name: Option<String>,
    pub store: Arc<dyn DocumentStore>,
    pub collection: String,
    pub timestamp_field: String,
    pub timestamp_kind: TimestampKind,
    /// Field holding the source's own identifier; the store document id
    /// when unset.
    pub id_field: Option<String>,
}

impl SourceDescriptor {
    /// Name used in operator-facing error entries.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.source_tag)
    }
}

impl fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("source_tag", &self.source_tag)
            .field("display_name", &self.display_name)
            .field("store", &self.store.describe())
            .field("collection", &self.collection)
            .field("timestamp_field", &self.timestamp_field)
            .field("timestamp_kind", &self.timestamp_kind)
            .field("id_field", &self.id_field)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source unavailable: {error}")]
    SourceUnavailable {
        source_tag: String,
        #[source]
        error: StoreError,
    },
    #[error("source query failed: {error}")]
    SourceQueryError {
        source_tag: String,
        #[source]
        error: StoreError,
    },
}

impl AdapterError {
    pub fn from_store(source_tag: &str, error: StoreError) -> Self {
        let source_tag = source_tag.to_string();
        match error.class() {
            FailureClass::Unavailable => AdapterError::SourceUnavailable { source_tag, error },
            FailureClass::Rejected => AdapterError::SourceQueryError { source_tag, error },
        }
    }

    pub fn source_tag(&self) -> &str {
        match self {
            AdapterError::SourceUnavailable { source_tag, .. }
            | AdapterError::SourceQueryError { source_tag, .. } => source_tag,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    fn timestamp_kind(&self) -> TimestampKind;

    /// Translates the cutoff into the value this source's field is compared to.
    fn cutoff_bound(&self, cutoff: DateTime<Utc>) -> TimestampBound {
        self.timestamp_kind().bound_for(cutoff)
    }

    /// Records whose timestamp field is at or after `cutoff` (inclusive).
    async fn fetch_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<RawLeadRecord>, AdapterError> {
        let descriptor = self.descriptor();
        let documents = descriptor
            .store
            .query_at_or_after(
                &descriptor.collection,
                &descriptor.timestamp_field,
                self.cutoff_bound(cutoff),
            )
            .await
            .map_err(|err| AdapterError::from_store(&descriptor.source_tag, err))?;
        Ok(to_raw_records(descriptor, documents))
    }
}

/// Source whose creation time is an integer count of epoch milliseconds.
#[derive(Debug, Clone)]
pub struct EpochMillisSource {
    descriptor: SourceDescriptor,
}

/// Source whose creation time is the store's native timestamp type.
#[derive(Debug, Clone)]
pub struct NativeTimestampSource {
    descriptor: SourceDescriptor,
}

impl EpochMillisSource {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        debug_assert_eq!(descriptor.timestamp_kind, TimestampKind::EpochMillis);
        Self { descriptor }
    }
}

impl NativeTimestampSource {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        debug_assert_eq!(descriptor.timestamp_kind, TimestampKind::NativeTimestamp);
        Self { descriptor }
    }
}

#[async_trait]
impl SourceAdapter for EpochMillisSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn timestamp_kind(&self) -> TimestampKind {
        TimestampKind::EpochMillis
    }
}

#[async_trait]
impl SourceAdapter for NativeTimestampSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn timestamp_kind(&self) -> TimestampKind {
        TimestampKind::NativeTimestamp
    }
}

pub fn adapter_for(descriptor: SourceDescriptor) -> Box<dyn SourceAdapter> {
    match descriptor.timestamp_kind {
        TimestampKind::EpochMillis => Box::new(EpochMillisSource::new(descriptor)),
        TimestampKind::NativeTimestamp => Box::new(NativeTimestampSource::new(descriptor)),
    }
}

fn to_raw_records(descriptor: &SourceDescriptor, documents: Vec<StoredDocument>) -> Vec<RawLeadRecord> {
    documents
        .into_iter()
        .filter_map(|doc| {
            let original_id = match &descriptor.id_field {
                None => Some(doc.id.clone()),
                Some(field) => doc.fields.get(field).and_then(|v| v.as_identifier()),
            };
            // Central ids are single path segments in document stores.
            let Some(original_id) = original_id.filter(|id| !id.contains('/')) else {
                warn!(
                    source = %descriptor.source_tag,
                    document = %doc.id,
                    id_field = descriptor.id_field.as_deref().unwrap_or("<document id>"),
                    "skipping record without usable identifier"
                );
                return None;
            };
            Some(RawLeadRecord {
                original_id,
                original_collection: descriptor.collection.clone(),
                fields: doc.fields,
            })
        })
        .collect()
}
