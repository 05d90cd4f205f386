//! Raw persisted documents and per-provider state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taxaline_dwca::{DatasetMeta, JoinedRecord};
use taxaline_store::{record_id, Document, StoreError};

/// Where and when a raw record was ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMeta {
    pub provider_id: String,
    pub version: String,
    pub ingested_at: DateTime<Utc>,
    pub archive_url: String,
    #[serde(default)]
    pub dataset_title: Option<String>,
}

/// Transform bookkeeping on a raw record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub is_processed: bool,
    pub last_transform_attempt: Option<DateTime<Utc>>,
    /// Pipeline version of the last attempt, successful or not.
    pub transform_version: Option<String>,
    /// Step that rejected or failed the record on the last attempt.
    #[serde(default)]
    pub rejected_by: Option<String>,
}

/// A joined archive record as stored in the raw collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    /// Provider-local record id (the core id column).
    pub local_id: String,
    pub record: Map<String, Value>,
    pub source: SourceMeta,
    #[serde(default)]
    pub status: ProcessingStatus,
}

impl RawRecord {
    pub fn from_joined(joined: JoinedRecord, source: &SourceMeta) -> Self {
        Self {
            local_id: joined.id.clone(),
            record: joined.into_map(),
            source: source.clone(),
            status: ProcessingStatus::default(),
        }
    }

    /// Stable id: same provider and local id always map to the same document.
    pub fn document_id(&self) -> String {
        record_id(&self.source.provider_id, &self.local_id)
    }

    pub fn to_document(&self) -> Result<Document, StoreError> {
        Ok(Document::from_serializable(self.document_id(), self)?
            .with_partition(&self.source.provider_id)
            .with_version(&self.source.version))
    }
}

/// Last successful ingestion of a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderState {
    pub provider_id: String,
    pub version: String,
    pub ingested_at: DateTime<Utc>,
    pub archive_url: String,
    pub records: u64,
    pub join_mode: String,
    #[serde(default)]
    pub dataset: DatasetMeta,
}

impl ProviderState {
    pub fn to_document(&self) -> Result<Document, StoreError> {
        Ok(Document::from_serializable(&self.provider_id, self)?
            .with_partition(&self.provider_id)
            .with_version(&self.version))
    }
}
