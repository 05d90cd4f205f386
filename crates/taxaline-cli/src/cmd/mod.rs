//! Subcommands

pub mod ingest;
pub mod lock;
pub mod metrics;
pub mod transform;

use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use taxaline_store::DuckStore;

use crate::config::Config;

/// Open the configured document store.
pub fn open_store(config: &Config) -> Result<Arc<DuckStore>> {
    let path = &config.store.path;
    let store = DuckStore::open(path, config.store.memory_limit.as_deref())
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    log::debug!("Opened store {}", path.display());
    Ok(Arc::new(store))
}

pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(headers.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

pub fn show_config(config: &Config) {
    let mut t = table(&["Setting", "Value"]);
    t.add_row(vec!["Store", &config.store.path.display().to_string()]);
    t.add_row(vec![
        "Memory limit",
        config.store.memory_limit.as_deref().unwrap_or("default"),
    ]);
    t.add_row(vec![
        "Work directory",
        &config.ingest.work_dir.display().to_string(),
    ]);
    t.add_row(vec![
        "Batched join above",
        &format!("{} bytes", config.ingest.batched_threshold_bytes),
    ]);
    t.add_row(vec!["Ingest workers", &config.ingest.workers.to_string()]);
    t.add_row(vec![
        "Transform",
        &format!(
            "{} v{} ({} workers)",
            config.transform.name, config.transform.version, config.transform.workers
        ),
    ]);
    t.add_row(vec![
        "Bulk writes",
        &format!(
            "{} ops / {} bytes",
            config.bulk.max_ops, config.bulk.max_bytes
        ),
    ]);
    t.add_row(vec!["Lock TTL", &format!("{}s", config.lock.ttl_secs)]);
    t.add_row(vec![
        "Read timeout",
        &format!("{}s", config.http.read_timeout),
    ]);
    t.add_row(vec!["Max retries", &config.http.max_retries.to_string()]);
    t.add_row(vec!["Stagger", &format!("{}ms", config.http.stagger_ms)]);
    t.add_row(vec![
        "Enrichment sources",
        &config
            .enrichment
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    ]);
    t.add_row(vec!["Providers", &config.providers.len().to_string()]);
    eprintln!("\n{t}");
}
