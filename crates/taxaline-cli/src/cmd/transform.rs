//! `taxaline transform` - normalize raw records

use anyhow::Result;
use clap::Args;
use taxaline_core::ProgressContext;
use taxaline_store::LockManager;
use taxaline_transform::Transformer;

use crate::config::Config;

#[derive(Args, Debug)]
pub struct TransformArgs {
    /// Version stamp for this run (overrides [transform] version)
    #[arg(long)]
    pub stamp: Option<String>,

    /// Take over a held transform lock
    #[arg(long)]
    pub force: bool,

    /// Reprocess records already current for this version
    #[arg(long)]
    pub reprocess: bool,

    /// Worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Raw records read per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Disable a pipeline step by name (repeatable)
    #[arg(long = "disable")]
    pub disabled_steps: Vec<String>,
}

pub fn run(args: TransformArgs, config: &Config, progress: &ProgressContext) -> Result<()> {
    let mut transform = config.transform_config();
    if let Some(v) = args.stamp {
        transform.version = v;
    }
    if let Some(w) = args.workers {
        transform.workers = w;
    }
    if let Some(n) = args.batch_size {
        transform.batch_size = n;
    }
    transform.force = args.force;
    transform.reprocess = args.reprocess;
    transform.disabled_steps.extend(args.disabled_steps);

    let store = super::open_store(config)?;
    let locks = LockManager::new(store.clone(), config.lock_config());
    let summary = Transformer::new(store, &locks, &transform, progress).run()?;
    if summary.interrupted {
        anyhow::bail!("Transform interrupted; rerun to continue");
    }
    Ok(())
}
