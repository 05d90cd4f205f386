//! taxaline-ingest: Darwin Core Archive ingestion
//!
//! Checks each provider's published version, downloads and joins archives
//! that changed, and writes the joined records into the raw collection.
//! Every provider runs under its own process lock and leaves one metrics
//! snapshot behind.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use taxaline_core::ProgressContext;
//! use taxaline_ingest::{HttpSource, IngestConfig, Ingestor, ProviderConfig};
//! use taxaline_store::{DuckStore, LockConfig, LockManager};
//!
//! let store = Arc::new(DuckStore::open("taxaline.duckdb".as_ref(), None)?);
//! let locks = LockManager::new(store.clone(), LockConfig::default());
//! let config = IngestConfig::default();
//! let progress = ProgressContext::new();
//! let providers = vec![ProviderConfig::new("kbif", "https://example.org/dwca.zip")];
//!
//! let ingestor = Ingestor::new(store, &locks, &HttpSource, &config, &progress);
//! let summary = ingestor.run(&providers)?;
//! println!("{} records", summary.records());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod raw;
pub mod runner;
pub mod source;
pub mod version;

pub use config::{IngestConfig, ProviderConfig};
pub use raw::{ProcessingStatus, ProviderState, RawRecord, SourceMeta};
pub use runner::{IngestSummary, Ingestor, JoinMode, ProviderOutcome, ProviderReport, PIPELINE};
pub use source::{ArchiveSource, HttpSource};
pub use version::{check_versions, stored_state, VersionCheck, VersionStatus};
