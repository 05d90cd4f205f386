//! taxaline - biodiversity archive pipeline
//!
//! Ingests Darwin Core Archives from data providers into a document store
//! and transforms them into normalized, enriched taxa.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "taxaline")]
#[command(about = "Darwin Core Archive ingestion and normalization pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./taxaline.toml or ~/.config/taxaline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Document store path (overrides [store] path)
    #[arg(long, global = true)]
    store: Option<std::path::PathBuf>,

    /// Read timeout in seconds for stall detection
    #[arg(long, global = true)]
    read_timeout: Option<u64>,

    /// Maximum retry attempts for transient failures
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Delay in milliseconds between ingest worker starts
    #[arg(long, global = true)]
    stagger_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Download and ingest provider archives into the raw collection
    Ingest(cmd::ingest::IngestArgs),
    /// Normalize raw records into the taxa collection
    Transform(cmd::transform::TransformArgs),
    /// Inspect or release process locks
    Lock(cmd::lock::LockArgs),
    /// Show recent run metrics
    Metrics(cmd::metrics::MetricsArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let progress = taxaline_core::ProgressContext::new();

    // Logging:
    //   TTY:     quiet (warn) unless --debug; progress bars show activity
    //   non-TTY: info unless --debug; logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = is_tty && !cli.debug;
    taxaline_core::init_logging(quiet, cli.debug, multi);

    let mut config = if let Some(path) = &cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };
    if let Some(path) = cli.store {
        config.store.path = path;
    }
    if let Some(secs) = cli.read_timeout {
        config.http.read_timeout = secs;
    }
    if let Some(n) = cli.max_retries {
        config.http.max_retries = n;
    }
    if let Some(ms) = cli.stagger_ms {
        config.http.stagger_ms = ms;
    }
    taxaline_core::set_http_config(config.http_config());

    if let Err(e) = taxaline_core::install_signal_handlers() {
        log::warn!("Failed to install signal handlers: {e}");
    }

    match cli.command {
        Command::Ingest(args) => cmd::ingest::run(args, &config, &progress),
        Command::Transform(args) => cmd::transform::run(args, &config, &progress),
        Command::Lock(args) => cmd::lock::run(args, &config),
        Command::Metrics(args) => cmd::metrics::run(args, &config),
        Command::Config => {
            cmd::show_config(&config);
            Ok(())
        }
    }
}
