//! Buffered bulk writes with store-limit enforcement
//!
//! Documents over the per-document limit are dropped and counted as
//! `docTooLarge`, never sent. A batch the backend rejects is retried in
//! halves until it succeeds or a single document fails.

use crate::document::{Document, StoreError, WriteSummary};
use crate::metrics::RunMetrics;
use crate::store::DocumentStore;

/// Error-histogram key for documents dropped before writing.
pub const DOC_TOO_LARGE: &str = "docTooLarge";

#[derive(Debug, Clone, Copy)]
pub struct BulkConfig {
    /// Flush once this many documents are pending.
    pub max_ops: usize,
    /// Flush once pending documents reach this many encoded bytes.
    pub max_bytes: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_ops: 1000,
            max_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BulkStats {
    pub written: WriteSummary,
    pub dropped_too_large: u64,
    pub flushes: u64,
}

/// Write `docs` in one call, splitting in half on failure.
pub fn write_with_halving(
    store: &dyn DocumentStore,
    collection: &str,
    docs: &[Document],
) -> Result<WriteSummary, StoreError> {
    if docs.is_empty() {
        return Ok(WriteSummary::default());
    }
    match store.upsert_many(collection, docs) {
        Ok(summary) => Ok(summary),
        Err(e) if docs.len() > 1 && e.is_splittable() => {
            let mid = docs.len() / 2;
            log::warn!(
                "Bulk write of {} docs to {collection} failed ({e}), retrying as {} + {}",
                docs.len(),
                mid,
                docs.len() - mid
            );
            let mut summary = write_with_halving(store, collection, &docs[..mid])?;
            summary += write_with_halving(store, collection, &docs[mid..])?;
            Ok(summary)
        }
        Err(e) => Err(e),
    }
}

/// Accumulates documents and flushes them by count or size.
pub struct BulkWriter<'a> {
    store: &'a dyn DocumentStore,
    collection: String,
    config: BulkConfig,
    metrics: Option<&'a RunMetrics>,
    pending: Vec<Document>,
    pending_bytes: usize,
    stats: BulkStats,
}

impl<'a> BulkWriter<'a> {
    pub fn new(store: &'a dyn DocumentStore, collection: &str, config: BulkConfig) -> Self {
        // never buffer more than the backend accepts in one call
        let limits = store.limits();
        let config = BulkConfig {
            max_ops: config.max_ops.clamp(1, limits.max_batch_ops.max(1)),
            max_bytes: config.max_bytes.min(limits.max_batch_bytes),
        };
        Self {
            store,
            collection: collection.to_string(),
            config,
            metrics: None,
            pending: Vec::with_capacity(config.max_ops),
            pending_bytes: 0,
            stats: BulkStats::default(),
        }
    }

    /// Report writes and drops into a run's metrics.
    pub fn with_metrics(mut self, metrics: &'a RunMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queue a document, flushing first if it would overflow the batch.
    ///
    /// Returns `Ok(false)` when the document was dropped as too large.
    pub fn push(&mut self, doc: Document) -> Result<bool, StoreError> {
        let bytes = doc.encoded_len()?;
        let limit = self.store.limits().max_document_bytes;
        if bytes > limit {
            log::warn!(
                "Dropping document {} from {}: {bytes} bytes exceeds {limit}",
                doc.id,
                self.collection
            );
            self.stats.dropped_too_large += 1;
            if let Some(m) = self.metrics {
                m.record_failure(DOC_TOO_LARGE);
            }
            return Ok(false);
        }

        if !self.pending.is_empty() && self.pending_bytes + bytes > self.config.max_bytes {
            self.flush()?;
        }
        self.pending.push(doc);
        self.pending_bytes += bytes;
        if self.pending.len() >= self.config.max_ops || self.pending_bytes >= self.config.max_bytes
        {
            self.flush()?;
        }
        Ok(true)
    }

    pub fn flush(&mut self) -> Result<WriteSummary, StoreError> {
        if self.pending.is_empty() {
            return Ok(WriteSummary::default());
        }
        let summary = write_with_halving(self.store, &self.collection, &self.pending)?;
        log::debug!(
            "Flushed {} docs ({} bytes) to {}",
            self.pending.len(),
            self.pending_bytes,
            self.collection
        );
        self.pending.clear();
        self.pending_bytes = 0;
        self.stats.written += summary;
        self.stats.flushes += 1;
        if let Some(m) = self.metrics {
            m.add_written(summary);
        }
        Ok(summary)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Flush what remains and return the totals.
    pub fn finish(mut self) -> Result<BulkStats, StoreError> {
        self.flush()?;
        Ok(self.stats)
    }
}
