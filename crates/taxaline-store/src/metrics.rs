//! Run metrics: a thread-safe accumulator and its persisted snapshot

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taxaline_core::fmt_num;
use uuid::Uuid;

use crate::document::{Document, StoreError, WriteSummary};
use crate::store::{collections, DocumentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Interrupted,
}

/// Counters shared by the workers of one run.
pub struct RunMetrics {
    started_at: DateTime<Utc>,
    processed: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    errors: Mutex<BTreeMap<String, u64>>,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            processed: AtomicU64::new(0),
            inserted: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errors: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_written(&self, summary: WriteSummary) {
        self.inserted.fetch_add(summary.inserted, Ordering::Relaxed);
        self.updated.fetch_add(summary.updated, Ordering::Relaxed);
    }

    /// A record that did not make it to the store.
    pub fn record_failure(&self, kind: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_error(kind);
    }

    /// Bump the error histogram without counting a failed record.
    pub fn record_error(&self, kind: &str) {
        self.record_errors(kind, 1);
    }

    pub fn record_errors(&self, kind: &str, n: u64) {
        if n == 0 {
            return;
        }
        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        *errors.entry(kind.to_string()).or_insert(0) += n;
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(
        &self,
        label: RunLabel,
        outcome: RunOutcome,
        error: Option<String>,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            run_id: Uuid::new_v4().to_string(),
            pipeline: label.pipeline,
            runner: label.runner,
            version: label.version,
            started_at: self.started_at,
            ended_at: Utc::now(),
            outcome,
            error,
            processed: self.processed(),
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            failed: self.failed(),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self
                .errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Identifies what a metrics snapshot belongs to.
#[derive(Debug, Clone)]
pub struct RunLabel {
    /// `ingest` or the transform pipeline name.
    pub pipeline: String,
    /// Provider id for ingestion, pipeline name for transforms.
    pub runner: String,
    pub version: Option<String>,
}

/// One persisted run. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub run_id: String,
    pub pipeline: String,
    pub runner: String,
    pub version: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn persist(&self, store: &dyn DocumentStore) -> Result<(), StoreError> {
        let mut doc =
            Document::from_serializable(&self.run_id, self)?.with_partition(&self.pipeline);
        doc.version = self.version.clone();
        store.insert_one(collections::METRICS, &doc)
    }

    /// Most recent snapshots first, optionally for one pipeline.
    pub fn recent(
        store: &dyn DocumentStore,
        pipeline: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Self>, StoreError> {
        let mut out = Vec::new();
        for doc in store.find_all(collections::METRICS)? {
            if pipeline.is_some() && doc.partition.as_deref() != pipeline {
                continue;
            }
            out.push(doc.decode::<Self>()?);
        }
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        Ok(out)
    }

    pub fn log(&self) {
        let secs = (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        log::info!(
            "=== {} [{}] {:?} in {secs:.1}s ===",
            self.pipeline,
            self.runner,
            self.outcome
        );
        log::info!(
            "processed {}, inserted {}, updated {}, failed {}, skipped {}",
            fmt_num(self.processed as usize),
            fmt_num(self.inserted as usize),
            fmt_num(self.updated as usize),
            fmt_num(self.failed as usize),
            fmt_num(self.skipped as usize),
        );
        for (kind, n) in &self.errors {
            log::info!("  {kind}: {n}");
        }
        if let Some(e) = &self.error {
            log::info!("error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn label(pipeline: &str) -> RunLabel {
        RunLabel {
            pipeline: pipeline.into(),
            runner: "p1".into(),
            version: Some("v1".into()),
        }
    }

    #[test]
    fn counters_and_histogram() {
        let m = RunMetrics::new();
        m.add_processed(3);
        m.add_written(WriteSummary {
            inserted: 2,
            updated: 1,
        });
        m.record_failure("docTooLarge");
        m.record_failure("docTooLarge");
        m.record_error("relatedNameMissing");
        let s = m.snapshot(label("ingest"), RunOutcome::Succeeded, None);
        assert_eq!(s.processed, 3);
        assert_eq!(s.inserted, 2);
        assert_eq!(s.updated, 1);
        assert_eq!(s.failed, 2);
        assert_eq!(s.errors["docTooLarge"], 2);
        assert_eq!(s.errors["relatedNameMissing"], 1);
    }

    #[test]
    fn persist_is_append_only() {
        let store = MemoryStore::new();
        let m = RunMetrics::new();
        let a = m.snapshot(label("ingest"), RunOutcome::Succeeded, None);
        let b = m.snapshot(label("taxa"), RunOutcome::Failed, Some("x".into()));
        a.persist(&store).unwrap();
        b.persist(&store).unwrap();
        assert!(a.persist(&store).is_err());

        assert_eq!(MetricsSnapshot::recent(&store, None, 10).unwrap().len(), 2);
        let only = MetricsSnapshot::recent(&store, Some("taxa"), 10).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].outcome, RunOutcome::Failed);
    }
}
