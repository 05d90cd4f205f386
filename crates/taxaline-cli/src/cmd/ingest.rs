//! `taxaline ingest` - fetch and ingest provider archives

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Args;
use taxaline_core::ProgressContext;
use taxaline_ingest::{HttpSource, Ingestor, ProviderOutcome};
use taxaline_store::{DocumentStore, LockManager, MemoryStore};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Only these provider ids (default: all configured providers)
    #[arg(short, long = "provider")]
    pub providers: Vec<String>,

    /// Re-ingest current versions and take over held locks
    #[arg(long)]
    pub force: bool,

    /// Use the batched join for every provider
    #[arg(long)]
    pub batched: bool,

    /// Providers ingested in parallel
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Scratch directory for downloads and extraction
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Keep downloaded and extracted files
    #[arg(long)]
    pub keep_work_dir: bool,

    /// Download and join into an in-memory store; nothing is persisted
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(args: IngestArgs, config: &Config, progress: &ProgressContext) -> Result<()> {
    let providers: Vec<_> = if args.providers.is_empty() {
        config.providers.clone()
    } else {
        for id in &args.providers {
            if !config.providers.iter().any(|p| &p.id == id) {
                bail!("Unknown provider '{id}'");
            }
        }
        config
            .providers
            .iter()
            .filter(|p| args.providers.contains(&p.id))
            .cloned()
            .collect()
    };
    if providers.is_empty() {
        bail!("No providers configured; add [[providers]] to taxaline.toml");
    }

    let mut ingest = config.ingest_config();
    ingest.force = args.force;
    ingest.force_batched = args.batched;
    ingest.keep_work_dir |= args.keep_work_dir;
    if let Some(w) = args.workers {
        ingest.workers = w;
    }
    if let Some(dir) = args.work_dir {
        ingest.work_dir = dir;
    }

    let store: Arc<dyn DocumentStore> = if args.dry_run {
        log::info!("Dry run: writing to an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        super::open_store(config)?
    };
    let locks = LockManager::new(Arc::clone(&store), config.lock_config());

    let ingestor = Ingestor::new(store, &locks, &HttpSource, &ingest, progress);
    let summary = ingestor.run(&providers)?;

    for report in &summary.reports {
        let line = match &report.outcome {
            ProviderOutcome::Ingested {
                version,
                records,
                superseded,
                mode,
            } => format!(
                "ingested version {version}: {records} records ({} join, {superseded} superseded)",
                mode.as_str()
            ),
            ProviderOutcome::UpToDate { version } => format!("up to date ({version})"),
            ProviderOutcome::Retired { reason } => format!("retired: {reason}"),
            ProviderOutcome::Offline { host, .. } => format!("offline: {host}"),
            ProviderOutcome::Locked { holder } => format!("locked by {holder}"),
            ProviderOutcome::Failed { error } => format!("FAILED: {error}"),
            ProviderOutcome::Interrupted => "interrupted".to_string(),
        };
        progress.println(format!("{:<24} {line}", report.provider_id));
    }

    if summary.failed() > 0 {
        bail!("{} of {} providers failed", summary.failed(), summary.reports.len());
    }
    Ok(())
}
