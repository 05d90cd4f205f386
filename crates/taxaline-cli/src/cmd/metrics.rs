//! `taxaline metrics` - recent run snapshots

use anyhow::Result;
use clap::Args;
use taxaline_store::MetricsSnapshot;

use crate::config::Config;

#[derive(Args, Debug)]
pub struct MetricsArgs {
    /// Only this pipeline (`ingest` or `transform`)
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of runs to show
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: usize,

    /// Include the error histogram of each run
    #[arg(long)]
    pub errors: bool,
}

pub fn run(args: MetricsArgs, config: &Config) -> Result<()> {
    let store = super::open_store(config)?;
    let runs = MetricsSnapshot::recent(store.as_ref(), args.pipeline.as_deref(), args.limit)?;
    if runs.is_empty() {
        eprintln!("No runs recorded.");
        return Ok(());
    }

    let mut headers = vec![
        "Started", "Pipeline", "Runner", "Version", "Outcome", "Processed", "Inserted", "Updated",
        "Failed", "Time",
    ];
    if args.errors {
        headers.push("Errors");
    }
    let mut table = super::table(&headers);
    for run in &runs {
        let secs = (run.ended_at - run.started_at).num_milliseconds() as f64 / 1000.0;
        let mut row = vec![
            run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            run.pipeline.clone(),
            run.runner.clone(),
            run.version.clone().unwrap_or_default(),
            format!("{:?}", run.outcome),
            run.processed.to_string(),
            run.inserted.to_string(),
            run.updated.to_string(),
            run.failed.to_string(),
            format!("{secs:.1}s"),
        ];
        if args.errors {
            row.push(
                run.errors
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(" "),
            );
        }
        table.add_row(row);
    }
    eprintln!("{table}");
    Ok(())
}
