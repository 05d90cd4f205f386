//! Transform run: raw records -> normalized taxa, under a pipeline lock

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use taxaline_core::{fmt_num, is_shutdown_requested, ProgressContext};
use taxaline_ingest::{ProcessingStatus, RawRecord};
use taxaline_store::{
    collections, resource_name, scan_batches, BulkConfig, BulkWriter, Document, DocumentStore,
    LockError, LockHandle, LockManager, RunLabel, RunMetrics, RunOutcome, StoreError,
};

use crate::enrich::{EnrichmentIndex, EnrichmentSource};
use crate::pipeline::PipelineOutcome;
use crate::steps::{taxon_pipeline, StepContext};
use crate::taxon::{NormalizedTaxon, SourceRef, TransformDoc};

/// Lock and metrics pipeline name for transform runs.
pub const PIPELINE: &str = "transform";

/// Error-histogram key for raw documents whose status stamp could not be
/// stored; those records are attempted again on the next run.
pub const RAW_STATUS_TOO_LARGE: &str = "rawStatusTooLarge";

#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Name of this transform; scopes the lock and the metrics.
    pub name: String,
    /// Stamp written on every normalized document.
    pub version: String,
    /// Raw documents read per batch
    pub batch_size: usize,
    pub workers: usize,
    /// Take over a held lock.
    pub force: bool,
    /// Reprocess records already current for this version.
    pub reprocess: bool,
    /// Steps to switch off by name.
    pub disabled_steps: Vec<String>,
    pub enrichment: Vec<EnrichmentSource>,
    pub bulk: BulkConfig,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            name: "taxa".to_string(),
            version: "1".to_string(),
            batch_size: 1_000,
            workers: 4,
            force: false,
            reprocess: false,
            disabled_steps: Vec::new(),
            enrichment: Vec::new(),
            bulk: BulkConfig::default(),
        }
    }
}

/// Result of a transform run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TransformSummary {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub rejected: u64,
    pub failed: u64,
    pub skipped: u64,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl TransformSummary {
    pub fn log(&self) {
        log::info!("=== Transform Summary ===");
        log::info!(
            "Processed: {} ({} skipped as current)",
            fmt_num(self.processed as usize),
            fmt_num(self.skipped as usize)
        );
        log::info!(
            "Written: {} inserted, {} updated",
            fmt_num(self.inserted as usize),
            fmt_num(self.updated as usize)
        );
        log::info!("Rejected: {}, failed: {}", self.rejected, self.failed);
        if self.interrupted {
            log::info!("Run interrupted before all records were read");
        }
        log::info!("Time: {:.1}s", self.elapsed.as_secs_f64());
    }
}

/// Per-batch counts kept outside the shared metrics.
#[derive(Debug, Default)]
struct Tally {
    rejected: u64,
    failed: u64,
}

pub struct Transformer<'a> {
    store: Arc<dyn DocumentStore>,
    locks: &'a LockManager,
    config: &'a TransformConfig,
    progress: &'a ProgressContext,
}

impl<'a> Transformer<'a> {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: &'a LockManager,
        config: &'a TransformConfig,
        progress: &'a ProgressContext,
    ) -> Self {
        Self {
            store,
            locks,
            config,
            progress,
        }
    }

    /// Run the transform under its lock and persist one metrics snapshot,
    /// whatever the outcome.
    pub fn run(&self) -> Result<TransformSummary> {
        let start = Instant::now();
        let resource = resource_name(PIPELINE, Some(&self.config.name));
        let metrics = RunMetrics::new();
        let interrupted = AtomicBool::new(false);

        let result = self
            .locks
            .with_lock(&resource, self.config.force, |handle| {
                self.run_locked(handle, &metrics, &interrupted)
            });

        let interrupted = interrupted.load(Ordering::Relaxed);
        let (outcome, error) = match &result {
            Ok(_) if interrupted => (RunOutcome::Interrupted, None),
            Ok(_) => (RunOutcome::Succeeded, None),
            Err(e) => {
                if e.downcast_ref::<LockError>().is_some() {
                    metrics.record_error("lock");
                }
                (RunOutcome::Failed, Some(format!("{e:#}")))
            }
        };
        let label = RunLabel {
            pipeline: PIPELINE.to_string(),
            runner: self.config.name.clone(),
            version: Some(self.config.version.clone()),
        };
        let snapshot = metrics.snapshot(label, outcome, error);
        if let Err(e) = snapshot.persist(self.store.as_ref()) {
            log::warn!("Failed to write transform metrics: {e}");
        }
        snapshot.log();

        let tally = result?;
        let summary = TransformSummary {
            processed: snapshot.processed,
            inserted: snapshot.inserted,
            updated: snapshot.updated,
            rejected: tally.rejected,
            failed: tally.failed,
            skipped: snapshot.skipped,
            interrupted,
            elapsed: start.elapsed(),
        };
        summary.log();
        Ok(summary)
    }

    fn run_locked(
        &self,
        handle: &LockHandle,
        metrics: &RunMetrics,
        interrupted: &AtomicBool,
    ) -> Result<Tally> {
        let store = self.store.as_ref();
        let config = self.config;

        let index = EnrichmentIndex::build(store, &config.enrichment)
            .context("Failed to build enrichment index")?;
        let mut pipeline = taxon_pipeline();
        for name in &config.disabled_steps {
            if !pipeline.set_enabled(name, false) {
                log::warn!("Unknown transform step '{name}' in disabled steps");
            }
        }
        log::info!("Transform steps: {}", pipeline.enabled_steps().join(" -> "));

        let current = if config.reprocess {
            FxHashSet::default()
        } else {
            store.ids_with_version(collections::TAXA, &config.version)?
        };
        if !current.is_empty() {
            log::info!(
                "{} normalized records already at version {}",
                fmt_num(current.len()),
                config.version
            );
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .build()
            .context("Failed to create thread pool")?;
        let ctx = StepContext {
            store,
            index: &index,
            metrics,
            version: &config.version,
        };
        let mut taxa = BulkWriter::new(store, collections::TAXA, config.bulk).with_metrics(metrics);
        // status writes are not output, so only their drops reach the metrics
        let mut raw_status = BulkWriter::new(store, collections::RAW, config.bulk);
        let mut tally = Tally::default();
        let line = self.progress.stage_line("transform");

        let batches = scan_batches(store, collections::RAW, config.batch_size, |docs| {
            if is_shutdown_requested() {
                interrupted.store(true, Ordering::Relaxed);
                return Ok(false);
            }
            let todo = self.select(docs, &current, metrics);
            let results: Vec<PipelineOutcome<TransformDoc>> = pool.install(|| {
                todo.par_iter()
                    .map(|raw| pipeline.run(transform_input(raw), &ctx))
                    .collect()
            });
            metrics.add_processed(todo.len() as u64);

            let now = Utc::now();
            for (mut raw, outcome) in todo.into_iter().zip(results) {
                let rejected_by = outcome.step().map(str::to_string);
                match outcome {
                    PipelineOutcome::Completed(doc) => {
                        taxa.push(taxon_document(&raw, &doc.taxon)?)?;
                    }
                    PipelineOutcome::Rejected { step } => {
                        tally.rejected += 1;
                        metrics.record_failure(&format!("rejected:{step}"));
                    }
                    PipelineOutcome::Failed { step, error } => {
                        tally.failed += 1;
                        log::debug!("{}: step {step} failed: {error}", raw.document_id());
                        metrics.record_failure(&format!("failed:{step}"));
                    }
                }
                raw.status = ProcessingStatus {
                    is_processed: rejected_by.is_none(),
                    last_transform_attempt: Some(now),
                    transform_version: Some(config.version.clone()),
                    rejected_by,
                };
                if !raw_status.push(raw.to_document()?)? {
                    metrics.record_error(RAW_STATUS_TOO_LARGE);
                }
            }
            // normalized output lands before the raw stamp that skips it
            taxa.flush()?;
            raw_status.flush()?;

            line.set_message(format!("{} processed", fmt_num(metrics.processed() as usize)));
            if let Err(e) = self.locks.heartbeat(handle) {
                log::warn!("Transform lock heartbeat failed: {e}");
            }
            Ok(true)
        })?;
        line.finish_and_clear();

        let written = taxa.finish()?;
        raw_status.finish()?;
        log::debug!(
            "Transform read {batches} raw batches, {} taxa flushes",
            written.flushes
        );
        Ok(tally)
    }

    /// Decode a raw batch and drop records already attempted at this version.
    fn select(
        &self,
        docs: Vec<Document>,
        current: &FxHashSet<String>,
        metrics: &RunMetrics,
    ) -> Vec<RawRecord> {
        let version = &self.config.version;
        let mut todo = Vec::with_capacity(docs.len());
        for doc in docs {
            let raw: RawRecord = match doc.decode() {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("Undecodable raw document {}: {e}", doc.id);
                    metrics.record_failure("undecodableRaw");
                    continue;
                }
            };
            // re-ingestion resets the status, so only the raw stamp marks a
            // record done; a stamped success whose output is gone is redone
            let stamped = raw.status.transform_version.as_deref() == Some(version.as_str());
            let done = stamped && (raw.status.rejected_by.is_some() || current.contains(&doc.id));
            if !self.config.reprocess && done {
                metrics.add_skipped(1);
                continue;
            }
            todo.push(raw);
        }
        todo
    }
}

fn transform_input(raw: &RawRecord) -> TransformDoc {
    TransformDoc::new(
        raw.record.clone(),
        SourceRef {
            raw_id: raw.document_id(),
            provider_id: raw.source.provider_id.clone(),
            record_id: raw.local_id.clone(),
            provider_version: raw.source.version.clone(),
        },
    )
}

/// Normalized documents share the raw document's id.
fn taxon_document(raw: &RawRecord, taxon: &NormalizedTaxon) -> Result<Document, StoreError> {
    Ok(Document::from_serializable(raw.document_id(), taxon)?
        .with_partition(&raw.source.provider_id)
        .with_version(&taxon.transform_version))
}
