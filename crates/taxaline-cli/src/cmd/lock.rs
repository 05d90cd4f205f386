//! `taxaline lock` - inspect and release process locks

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};

use taxaline_store::{LockManager, LockState};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct LockArgs {
    #[command(subcommand)]
    pub action: LockAction,
}

#[derive(Subcommand, Debug)]
pub enum LockAction {
    /// List every lock and its state
    List,
    /// Mark a stuck lock failed so the next run can acquire it
    Release {
        /// Resource name, e.g. `ingest:kbif` or `transform:taxa`
        resource: String,

        /// Reason recorded on the lock
        #[arg(long, default_value = "released by operator")]
        reason: String,
    },
}

pub fn run(args: LockArgs, config: &Config) -> Result<()> {
    let store = super::open_store(config)?;
    let locks = LockManager::new(store, config.lock_config());
    match args.action {
        LockAction::List => list(&locks),
        LockAction::Release { resource, reason } => {
            match locks
                .force_release(&resource, &reason)
                .with_context(|| format!("Failed to release lock '{resource}'"))?
            {
                Some(prev) => eprintln!(
                    "Released '{resource}' (was {} by {})",
                    prev.state, prev.holder_id
                ),
                None => eprintln!("No lock named '{resource}'; recorded as failed anyway."),
            }
            Ok(())
        }
    }
}

fn list(locks: &LockManager) -> Result<()> {
    let records = locks.list()?;
    if records.is_empty() {
        eprintln!("No locks.");
        return Ok(());
    }

    let now = Utc::now();
    let mut table = super::table(&["Resource", "State", "Holder", "Started", "Expires", "Note"]);
    for r in &records {
        let state = if r.state == LockState::Running && !r.is_live(now) {
            "running (stale)".to_string()
        } else {
            r.state.to_string()
        };
        let note = match (&r.error, r.forced) {
            (Some(e), _) => e.clone(),
            (None, true) => "forced".to_string(),
            (None, false) => String::new(),
        };
        table.add_row(vec![
            r.resource.clone(),
            state,
            r.holder_id.chars().take(8).collect(),
            r.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            r.expires_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            note,
        ]);
    }
    eprintln!("{table}");
    Ok(())
}
