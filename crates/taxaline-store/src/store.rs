//! The document-store contract every pipeline stage writes through

use rustc_hash::FxHashSet;

use crate::document::{Document, StoreError, StoreLimits, WriteSummary};

/// Collection names shared by ingestion, transformation, and the CLI.
pub mod collections {
    /// Joined archive records, one per provider record.
    pub const RAW: &str = "raw_records";
    /// Normalized taxon documents.
    pub const TAXA: &str = "taxa";
    /// Per-provider ingestion state (last version, dataset metadata).
    pub const PROVIDERS: &str = "providers";
    /// Process locks, keyed by resource name.
    pub const LOCKS: &str = "process_locks";
    /// Append-only run metrics.
    pub const METRICS: &str = "pipeline_metrics";
}

/// Guard evaluated against the current document inside a conditional write.
pub type WriteGuard<'a> = dyn Fn(Option<&Document>) -> bool + 'a;

/// Outcome of [`DocumentStore::replace_if`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalWrite {
    Written,
    /// The guard refused; carries the document that was in place.
    Rejected(Option<Document>),
}

/// Keyed JSON document storage.
///
/// Implementations must make [`replace_if`](Self::replace_if) atomic with
/// respect to other callers of the same store: the guard and the write
/// happen as one step.
pub trait DocumentStore: Send + Sync {
    fn limits(&self) -> StoreLimits;

    fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    fn find_all(&self, collection: &str) -> Result<Vec<Document>, StoreError>;

    /// Up to `limit` documents whose id sorts after `after`, ascending by id.
    fn scan_after(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    fn ids_with_version(
        &self,
        collection: &str,
        version: &str,
    ) -> Result<FxHashSet<String>, StoreError>;

    fn count_with_version(&self, collection: &str, version: &str) -> Result<u64, StoreError>;

    fn count(&self, collection: &str) -> Result<u64, StoreError>;

    /// Insert or replace each document by id. All-or-nothing per call.
    fn upsert_many(&self, collection: &str, docs: &[Document])
        -> Result<WriteSummary, StoreError>;

    /// Append a document; fails if the id already exists.
    fn insert_one(&self, collection: &str, doc: &Document) -> Result<(), StoreError>;

    /// Write `doc` only if `guard` accepts the current document under the same id.
    fn replace_if(
        &self,
        collection: &str,
        guard: &WriteGuard<'_>,
        doc: &Document,
    ) -> Result<ConditionalWrite, StoreError>;

    /// Delete documents in `partition` whose version differs from `keep_version`.
    fn delete_superseded(
        &self,
        collection: &str,
        partition: &str,
        keep_version: &str,
    ) -> Result<u64, StoreError>;
}

/// Walk a collection in id order, `batch_size` documents at a time.
///
/// The callback returns `false` to stop early. Returns the number of
/// documents visited.
pub fn scan_batches<F>(
    store: &dyn DocumentStore,
    collection: &str,
    batch_size: usize,
    mut f: F,
) -> Result<u64, StoreError>
where
    F: FnMut(Vec<Document>) -> Result<bool, StoreError>,
{
    let batch_size = batch_size.max(1);
    let mut cursor: Option<String> = None;
    let mut seen = 0u64;
    loop {
        let batch = store.scan_after(collection, cursor.as_deref(), batch_size)?;
        let Some(last) = batch.last() else { break };
        cursor = Some(last.id.clone());
        let short = batch.len() < batch_size;
        seen += batch.len() as u64;
        if !f(batch)? || short {
            break;
        }
    }
    Ok(seen)
}

pub(crate) fn validate_collection(name: &str) -> Result<(), StoreError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names() {
        assert!(validate_collection(collections::RAW).is_ok());
        assert!(validate_collection("taxa_v2").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("drop table;").is_err());
        assert!(validate_collection("Taxa").is_err());
    }
}
