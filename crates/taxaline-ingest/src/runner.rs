//! Ingestion run: version checks, then one locked job per provider

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::ProgressBar;
use rustc_hash::FxHashSet;
use taxaline_core::{
    fmt_num, http_config, is_shutdown_requested, ErrorCategory, ProgressContext, WorkQueue,
};
use taxaline_dwca::{
    data_size, extract_zip, find_archive_root, join_archive, parse_eml, DatasetMeta, JoinStats,
    JoinedRecord, Manifest,
};
use taxaline_join::{BatchedJoin, JoinConfig};
use taxaline_store::{
    collections, resource_name, BulkConfig, BulkWriter, DocumentStore, LockError, LockHandle,
    LockManager, RunLabel, RunMetrics, RunOutcome,
};

use crate::config::{IngestConfig, ProviderConfig};
use crate::raw::{ProviderState, RawRecord, SourceMeta};
use crate::source::ArchiveSource;
use crate::version::{check_versions, VersionCheck, VersionStatus};

/// Lock and metrics pipeline name for ingestion.
pub const PIPELINE: &str = "ingest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    Streaming,
    Batched,
}

impl JoinMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Batched => "batched",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutcome {
    Ingested {
        version: String,
        records: u64,
        superseded: u64,
        mode: JoinMode,
    },
    UpToDate {
        version: String,
    },
    /// The provider retired the archive or its metadata (404/410).
    Retired {
        reason: String,
    },
    /// The provider's host could not be reached.
    Offline {
        host: String,
        reason: String,
    },
    /// Another run holds this provider's lock.
    Locked {
        holder: String,
    },
    Failed {
        error: String,
    },
    Interrupted,
}

impl ProviderOutcome {
    /// Whether this outcome makes the whole invocation unsuccessful.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Locked { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ProviderReport {
    pub provider_id: String,
    pub outcome: ProviderOutcome,
}

/// Shutdown was requested while a provider was being written.
#[derive(Debug)]
struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupted by shutdown request")
    }
}

impl std::error::Error for Interrupted {}

/// Runs ingestion for a set of providers against one store.
pub struct Ingestor<'a> {
    store: Arc<dyn DocumentStore>,
    locks: &'a LockManager,
    source: &'a dyn ArchiveSource,
    config: &'a IngestConfig,
    progress: &'a ProgressContext,
    offline_hosts: Mutex<FxHashSet<String>>,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: &'a LockManager,
        source: &'a dyn ArchiveSource,
        config: &'a IngestConfig,
        progress: &'a ProgressContext,
    ) -> Self {
        Self {
            store,
            locks,
            source,
            config,
            progress,
            offline_hosts: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn run(&self, providers: &[ProviderConfig]) -> Result<IngestSummary> {
        let start = Instant::now();
        fs::create_dir_all(&self.config.work_dir).with_context(|| {
            format!(
                "Failed to create work dir: {}",
                self.config.work_dir.display()
            )
        })?;

        log::info!("Checking versions of {} providers", providers.len());
        let checks = check_versions(
            providers,
            self.store.as_ref(),
            self.source,
            self.config.version_check_concurrency,
        )?;

        let mut reports: Vec<(usize, ProviderReport)> = Vec::new();
        let mut jobs = Vec::new();
        for (i, (provider, check)) in providers.iter().zip(checks).enumerate() {
            let report = |outcome| {
                (
                    i,
                    ProviderReport {
                        provider_id: provider.id.clone(),
                        outcome,
                    },
                )
            };
            let skipped = match check.status.clone() {
                _ if check.needs_ingest(self.config.force) => None,
                VersionStatus::Current { version } => {
                    log::info!("{}: version {version} is current, skipping", provider.id);
                    Some(ProviderOutcome::UpToDate { version })
                }
                VersionStatus::Retired { reason } => {
                    log::info!("{}: metadata retired ({reason}), skipping", provider.id);
                    let outcome = ProviderOutcome::Retired { reason };
                    self.persist_metrics(provider, None, &RunMetrics::new(), &outcome);
                    Some(outcome)
                }
                VersionStatus::Offline { reason } => {
                    let host = provider.host();
                    log::warn!("{}: host {host} unreachable ({reason})", provider.id);
                    self.mark_offline(&host);
                    let outcome = ProviderOutcome::Offline { host, reason };
                    self.persist_metrics(provider, None, &RunMetrics::new(), &outcome);
                    Some(outcome)
                }
                VersionStatus::Outdated { .. } | VersionStatus::Unknown { .. } => None,
            };
            match skipped {
                Some(outcome) => reports.push(report(outcome)),
                None => jobs.push((i, provider, check)),
            }
        }

        let queue = WorkQueue::new(jobs);
        let done = Mutex::new(Vec::with_capacity(queue.total()));
        let workers = self.config.workers.clamp(1, queue.total().max(1));
        if queue.total() > 0 {
            log::info!(
                "Ingesting {} providers with {workers} workers",
                queue.total()
            );
        }

        let stagger_ms = http_config().stagger_ms;
        let (pending, finished) = (&queue, &done);
        rayon::scope(|s| {
            for w in 0..workers {
                s.spawn(move |_| {
                    let delay = stagger_delay(w, stagger_ms);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    while let Some((i, provider, check)) = pending.next() {
                        let outcome = if is_shutdown_requested() {
                            ProviderOutcome::Interrupted
                        } else {
                            self.ingest_provider(provider, check)
                        };
                        let report = ProviderReport {
                            provider_id: provider.id.clone(),
                            outcome,
                        };
                        finished
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push((*i, report));
                    }
                });
            }
        });

        reports.extend(done.into_inner().unwrap_or_else(PoisonError::into_inner));
        reports.sort_by_key(|(i, _)| *i);
        let summary = IngestSummary {
            reports: reports.into_iter().map(|(_, r)| r).collect(),
            elapsed: start.elapsed(),
        };
        summary.log();
        Ok(summary)
    }

    fn mark_offline(&self, host: &str) {
        self.offline_hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_string());
    }

    fn is_offline(&self, host: &str) -> bool {
        self.offline_hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(host)
    }

    /// Ingest one provider under its lock. Never returns an error: every
    /// failure becomes an outcome and a metrics snapshot.
    fn ingest_provider(&self, provider: &ProviderConfig, check: &VersionCheck) -> ProviderOutcome {
        let host = provider.host();
        if self.is_offline(&host) {
            log::warn!("{}: host {host} went offline earlier, skipping", provider.id);
            let outcome = ProviderOutcome::Offline {
                host,
                reason: "host marked offline earlier in this run".into(),
            };
            self.persist_metrics(provider, None, &RunMetrics::new(), &outcome);
            return outcome;
        }

        let metrics = RunMetrics::new();
        let pb = self.progress.provider_bar(&provider.id);
        let resource = resource_name(PIPELINE, Some(&provider.id));
        let result = self
            .locks
            .with_lock(&resource, self.config.force, |handle| {
                self.ingest_locked(provider, check, handle, &metrics, &pb)
            });
        pb.finish_and_clear();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(LockError::Held { current, .. }) = e.downcast_ref::<LockError>() {
                    log::warn!("{}: {e}", provider.id);
                    metrics.record_error(ErrorCategory::Lock.as_str());
                    ProviderOutcome::Locked {
                        holder: current.holder_id.clone(),
                    }
                } else if e.downcast_ref::<Interrupted>().is_some() {
                    log::warn!("{}: interrupted", provider.id);
                    ProviderOutcome::Interrupted
                } else {
                    log::error!("{}: {e:#}", provider.id);
                    metrics.record_error(error_kind(&e).as_str());
                    ProviderOutcome::Failed {
                        error: format!("{e:#}"),
                    }
                }
            }
        };
        let version = match &outcome {
            ProviderOutcome::Ingested { version, .. } => Some(version.clone()),
            _ => check.remote_version().map(str::to_string),
        };
        self.persist_metrics(provider, version, &metrics, &outcome);
        outcome
    }

    fn ingest_locked(
        &self,
        provider: &ProviderConfig,
        check: &VersionCheck,
        handle: &LockHandle,
        metrics: &RunMetrics,
        pb: &ProgressBar,
    ) -> Result<ProviderOutcome> {
        let work = self.config.work_dir.join(dir_name(&provider.id));
        reset_dir(&work)?;

        let zip_path = work.join("archive.zip");
        pb.set_message("downloading");
        match self.source.download(&provider.archive_url, &zip_path, pb) {
            Ok(bytes) => log::debug!("{}: downloaded {bytes} bytes", provider.id),
            Err(e) => match e.category() {
                ErrorCategory::NotFound => {
                    log::info!("{}: archive retired ({e}), skipping", provider.id);
                    metrics.record_error(ErrorCategory::NotFound.as_str());
                    return Ok(ProviderOutcome::Retired {
                        reason: e.to_string(),
                    });
                }
                ErrorCategory::Transport => {
                    let host = provider.host();
                    log::warn!("{}: host {host} unreachable ({e})", provider.id);
                    self.mark_offline(&host);
                    metrics.record_error(ErrorCategory::Transport.as_str());
                    return Ok(ProviderOutcome::Offline {
                        host,
                        reason: e.to_string(),
                    });
                }
                _ => return Err(anyhow::Error::new(e).context("Archive download failed")),
            },
        }

        pb.set_message("extracting");
        let extracted = work.join("archive");
        extract_zip(&zip_path, &extracted)?;
        let root = find_archive_root(&extracted)?;
        let manifest = Manifest::read_from(&root)?;

        let (version, dataset) = resolve_version(check, &root);
        let source_meta = SourceMeta {
            provider_id: provider.id.clone(),
            version: version.clone(),
            ingested_at: Utc::now(),
            archive_url: provider.archive_url.clone(),
            dataset_title: dataset.title.clone(),
        };

        let locations = std::iter::once(&manifest.core)
            .chain(&manifest.extensions)
            .map(|f| f.location.as_str());
        let size = data_size(&root, locations);
        let mode = if self.config.force_batched
            || provider.force_batched
            || size > self.config.batched_threshold_bytes
        {
            JoinMode::Batched
        } else {
            JoinMode::Streaming
        };
        log::info!(
            "{}: version {version}, {} of data, {} join",
            provider.id,
            human_bytes(size),
            mode.as_str()
        );

        let bulk = BulkConfig {
            max_ops: self.config.write_batch_size,
            ..BulkConfig::default()
        };
        let mut writer =
            BulkWriter::new(self.store.as_ref(), collections::RAW, bulk).with_metrics(metrics);
        pb.set_message("writing");

        let stats = match mode {
            JoinMode::Streaming => {
                let joined = join_archive(&root, &manifest)?;
                let stats = joined.stats.clone();
                for record in joined.into_records() {
                    if is_shutdown_requested() {
                        return Err(Interrupted.into());
                    }
                    write_record(&mut writer, record, &source_meta, metrics)?;
                }
                stats
            }
            JoinMode::Batched => {
                let config = JoinConfig {
                    work_dir: work.join("join"),
                    batch_size: self.config.join_batch_size,
                    memory_limit: self.config.memory_limit.clone(),
                };
                let engine = BatchedJoin::load(&root, &manifest, &config)?;
                for batch in engine.batches() {
                    if is_shutdown_requested() {
                        return Err(Interrupted.into());
                    }
                    for record in batch? {
                        write_record(&mut writer, record, &source_meta, metrics)?;
                    }
                    pb.set_message(format!("writing ({})", fmt_num(metrics.processed() as usize)));
                    if let Err(e) = self.locks.heartbeat(handle) {
                        log::warn!("{}: lock heartbeat failed: {e}", provider.id);
                    }
                }
                engine.stats().clone()
            }
        };
        let written = writer.finish()?;
        record_join_stats(metrics, &stats);

        let superseded = self
            .store
            .delete_superseded(collections::RAW, &provider.id, &version)?;
        if superseded > 0 {
            log::info!(
                "{}: removed {superseded} raw records from older versions",
                provider.id
            );
        }

        let state = ProviderState {
            provider_id: provider.id.clone(),
            version: version.clone(),
            ingested_at: source_meta.ingested_at,
            archive_url: provider.archive_url.clone(),
            records: written.written.total(),
            join_mode: mode.as_str().to_string(),
            dataset,
        };
        self.store
            .upsert_many(collections::PROVIDERS, &[state.to_document()?])?;

        if !self.config.keep_work_dir {
            if let Err(e) = fs::remove_dir_all(&work) {
                log::debug!("{}: failed to clean {}: {e}", provider.id, work.display());
            }
        }

        Ok(ProviderOutcome::Ingested {
            version,
            records: written.written.total(),
            superseded,
            mode,
        })
    }

    fn persist_metrics(
        &self,
        provider: &ProviderConfig,
        version: Option<String>,
        metrics: &RunMetrics,
        outcome: &ProviderOutcome,
    ) {
        let (run_outcome, error) = match outcome {
            ProviderOutcome::Failed { error } => (RunOutcome::Failed, Some(error.clone())),
            ProviderOutcome::Locked { holder } => (
                RunOutcome::Failed,
                Some(format!("lock held by {holder}")),
            ),
            ProviderOutcome::Interrupted => (RunOutcome::Interrupted, None),
            ProviderOutcome::Retired { reason } | ProviderOutcome::Offline { reason, .. } => {
                (RunOutcome::Succeeded, Some(reason.clone()))
            }
            _ => (RunOutcome::Succeeded, None),
        };
        let label = RunLabel {
            pipeline: PIPELINE.to_string(),
            runner: provider.id.clone(),
            version,
        };
        let snapshot = metrics.snapshot(label, run_outcome, error);
        if let Err(e) = snapshot.persist(self.store.as_ref()) {
            log::warn!("{}: failed to write metrics: {e}", provider.id);
        }
    }
}

fn write_record(
    writer: &mut BulkWriter<'_>,
    record: JoinedRecord,
    source: &SourceMeta,
    metrics: &RunMetrics,
) -> Result<()> {
    metrics.add_processed(1);
    let raw = RawRecord::from_joined(record, source);
    match raw.to_document() {
        Ok(doc) => {
            writer.push(doc)?;
        }
        Err(e) => {
            log::debug!("{}: unstorable record {}: {e}", source.provider_id, raw.local_id);
            metrics.record_failure(e.category().as_str());
        }
    }
    Ok(())
}

fn record_join_stats(metrics: &RunMetrics, stats: &JoinStats) {
    stats.log();
    metrics.record_errors("orphanExtensionRow", stats.orphan_extension_rows);
    metrics.record_errors("duplicateId", stats.duplicate_ids);
    metrics.record_errors("missingId", stats.missing_ids);
}

/// Version from the metadata check, else the archive's own eml.xml, else
/// a timestamp so that every ingestion still supersedes the previous one.
fn resolve_version(check: &VersionCheck, root: &Path) -> (String, DatasetMeta) {
    let remote = match &check.status {
        VersionStatus::Outdated { dataset, .. } => Some(dataset.clone()),
        _ => None,
    };
    let local = fs::read_to_string(root.join("eml.xml"))
        .ok()
        .and_then(|xml| match parse_eml(&xml) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::warn!("{}: unreadable eml.xml: {e}", check.provider_id);
                None
            }
        });
    let dataset = remote
        .filter(|d| d.package_id.is_some())
        .or(local)
        .unwrap_or_default();
    let version = check
        .remote_version()
        .map(str::to_string)
        .or_else(|| dataset.version.clone())
        .unwrap_or_else(|| format!("unversioned-{}", Utc::now().format("%Y%m%d%H%M%S")));
    (version, dataset)
}

/// Start offset of worker `w`: first downloads go out `stagger_ms` apart.
fn stagger_delay(worker: usize, stagger_ms: u64) -> Duration {
    Duration::from_millis(stagger_ms.saturating_mul(worker as u64))
}

/// Map an ingestion failure to its error category.
fn error_kind(e: &anyhow::Error) -> ErrorCategory {
    if let Some(e) = e.downcast_ref::<taxaline_dwca::DwcaError>() {
        return e.category();
    }
    if let Some(e) = e.downcast_ref::<taxaline_store::StoreError>() {
        return e.category();
    }
    ErrorCategory::Write
}

fn dir_name(provider_id: &str) -> String {
    provider_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(())
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Result of an ingestion run
#[derive(Debug)]
pub struct IngestSummary {
    pub reports: Vec<ProviderReport>,
    pub elapsed: Duration,
}

impl IngestSummary {
    fn count(&self, f: impl Fn(&ProviderOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| f(&r.outcome)).count()
    }

    pub fn ingested(&self) -> usize {
        self.count(|o| matches!(o, ProviderOutcome::Ingested { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(ProviderOutcome::is_failure)
    }

    pub fn records(&self) -> u64 {
        self.reports
            .iter()
            .map(|r| match r.outcome {
                ProviderOutcome::Ingested { records, .. } => records,
                _ => 0,
            })
            .sum()
    }

    pub fn log(&self) {
        log::info!("=== Ingest Summary ===");
        log::info!(
            "Providers: {} ingested, {} up to date, {} retired, {} offline, {} failed",
            self.ingested(),
            self.count(|o| matches!(o, ProviderOutcome::UpToDate { .. })),
            self.count(|o| matches!(o, ProviderOutcome::Retired { .. })),
            self.count(|o| matches!(o, ProviderOutcome::Offline { .. })),
            self.failed(),
        );
        let interrupted = self.count(|o| matches!(o, ProviderOutcome::Interrupted));
        if interrupted > 0 {
            log::info!("Interrupted: {interrupted}");
        }
        log::info!("Records: {}", fmt_num(self.records() as usize));
        log::info!("Time: {:.1}s", self.elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_names_are_safe() {
        assert_eq!(dir_name("kbif-flora_1.0"), "kbif-flora_1.0");
        assert_eq!(dir_name("a/b c"), "a_b_c");
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn workers_start_staggered() {
        assert_eq!(stagger_delay(0, 250), Duration::ZERO);
        assert_eq!(stagger_delay(3, 250), Duration::from_millis(750));
        assert_eq!(stagger_delay(5, 0), Duration::ZERO);
    }

    #[test]
    fn failure_outcomes() {
        assert!(ProviderOutcome::Failed { error: "x".into() }.is_failure());
        assert!(ProviderOutcome::Locked { holder: "h".into() }.is_failure());
        assert!(!ProviderOutcome::Retired { reason: "404".into() }.is_failure());
        assert!(!ProviderOutcome::Interrupted.is_failure());
    }

    #[test]
    fn summary_log_empty() {
        let summary = IngestSummary {
            reports: vec![],
            elapsed: Duration::ZERO,
        };
        assert_eq!(summary.records(), 0);
        summary.log();
    }
}
