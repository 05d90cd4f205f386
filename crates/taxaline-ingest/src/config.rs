//! Ingestion configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One data provider and where its archive lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub archive_url: String,
    /// EML document whose `packageId` carries the published version.
    #[serde(default)]
    pub metadata_url: Option<String>,
    /// Always use the batched join for this provider.
    #[serde(default)]
    pub force_batched: bool,
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, archive_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            archive_url: archive_url.into(),
            metadata_url: None,
            force_batched: false,
        }
    }

    pub fn with_metadata(mut self, url: impl Into<String>) -> Self {
        self.metadata_url = Some(url.into());
        self
    }

    /// Host serving the archive, used to short-circuit offline servers.
    pub fn host(&self) -> String {
        reqwest::Url::parse(&self.archive_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.archive_url.clone())
    }
}

/// Runtime configuration for an ingestion run
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Scratch space for downloads, extraction, and the batched join database
    pub work_dir: PathBuf,
    /// Uncompressed data size above which the batched join is used
    pub batched_threshold_bytes: u64,
    /// Core records per batched-join batch
    pub join_batch_size: usize,
    /// Raw documents per store write
    pub write_batch_size: usize,
    /// Providers ingested in parallel
    pub workers: usize,
    /// Concurrent metadata requests during version checks
    pub version_check_concurrency: usize,
    /// Re-ingest even when the stored version is current; take over held locks
    pub force: bool,
    /// Use the batched join for every provider
    pub force_batched: bool,
    /// DuckDB memory limit for the batched join
    pub memory_limit: Option<String>,
    /// Keep downloaded and extracted files after a successful run
    pub keep_work_dir: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            batched_threshold_bytes: 512 * 1024 * 1024,
            join_batch_size: 5_000,
            write_batch_size: 1_000,
            workers: 4,
            version_check_concurrency: 8,
            force: false,
            force_batched: false,
            memory_limit: None,
            keep_work_dir: false,
        }
    }
}
