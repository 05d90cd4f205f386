//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use taxaline_core::HttpConfig;
use taxaline_ingest::{IngestConfig, ProviderConfig};
use taxaline_store::{BulkConfig, LockConfig};
use taxaline_transform::{EnrichmentSource, TransformConfig};

/// Global configuration for taxaline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub store: StoreSection,
    pub http: HttpSection,
    pub ingest: IngestSection,
    pub transform: TransformSection,
    pub bulk: BulkSection,
    pub lock: LockSection,
    pub enrichment: Vec<EnrichmentSource>,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
    /// DuckDB memory limit, e.g. "4GB"
    pub memory_limit: Option<String>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./taxaline.duckdb"),
            memory_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    /// Seconds without a received chunk before a download is aborted
    pub read_timeout: u64,
    /// Seconds allowed for a whole metadata request
    pub metadata_timeout: u64,
    pub max_retries: u32,
    /// Milliseconds between ingest worker starts
    pub stagger_ms: u64,
    pub version_check_concurrency: usize,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            read_timeout: 30,
            metadata_timeout: 10,
            max_retries: 3,
            stagger_ms: 0,
            version_check_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub work_dir: PathBuf,
    pub batched_threshold_bytes: u64,
    pub join_batch_size: usize,
    pub write_batch_size: usize,
    pub workers: usize,
    pub keep_work_dir: bool,
}

impl Default for IngestSection {
    fn default() -> Self {
        let defaults = IngestConfig::default();
        Self {
            work_dir: defaults.work_dir,
            batched_threshold_bytes: defaults.batched_threshold_bytes,
            join_batch_size: defaults.join_batch_size,
            write_batch_size: defaults.write_batch_size,
            workers: defaults.workers,
            keep_work_dir: defaults.keep_work_dir,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransformSection {
    pub name: String,
    pub version: String,
    pub batch_size: usize,
    pub workers: usize,
    pub disabled_steps: Vec<String>,
}

impl Default for TransformSection {
    fn default() -> Self {
        let defaults = TransformConfig::default();
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            name: defaults.name,
            version: defaults.version,
            batch_size: defaults.batch_size,
            workers: cpus.min(8),
            disabled_steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BulkSection {
    pub max_ops: usize,
    pub max_bytes: usize,
}

impl Default for BulkSection {
    fn default() -> Self {
        let defaults = BulkConfig::default();
        Self {
            max_ops: defaults.max_ops,
            max_bytes: defaults.max_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub ttl_secs: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self { ttl_secs: 30 * 60 }
    }
}

/// Expand every `${VAR}` in `s` from the environment.
///
/// Errors with the variable name when it is unset.
fn expand_env_vars(s: &str) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // unterminated: keep literally
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        out.push_str(&std::env::var(name).map_err(|_| name.to_string())?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn expand_field(value: &mut String, what: &str) -> Result<()> {
    *value = expand_env_vars(value)
        .map_err(|var| anyhow::anyhow!("{what}: environment variable {var} is not set"))?;
    Ok(())
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./taxaline.toml (current directory)
    /// 2. ~/.config/taxaline/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("taxaline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "taxaline") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Invalid TOML")?;
        for p in &mut config.providers {
            expand_field(&mut p.archive_url, &format!("provider {} archive_url", p.id))?;
            if let Some(url) = &mut p.metadata_url {
                expand_field(url, &format!("provider {} metadata_url", p.id))?;
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for p in &config.providers {
            anyhow::ensure!(seen.insert(p.id.as_str()), "duplicate provider id '{}'", p.id);
        }
        Ok(config)
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            read_timeout: Duration::from_secs(self.http.read_timeout),
            metadata_timeout: Duration::from_secs(self.http.metadata_timeout),
            max_retries: self.http.max_retries,
            stagger_ms: self.http.stagger_ms,
        }
    }

    pub fn bulk_config(&self) -> BulkConfig {
        BulkConfig {
            max_ops: self.bulk.max_ops,
            max_bytes: self.bulk.max_bytes,
        }
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            ttl: Duration::from_secs(self.lock.ttl_secs),
        }
    }

    pub fn ingest_config(&self) -> IngestConfig {
        let s = &self.ingest;
        IngestConfig {
            work_dir: s.work_dir.clone(),
            batched_threshold_bytes: s.batched_threshold_bytes,
            join_batch_size: s.join_batch_size,
            write_batch_size: s.write_batch_size,
            workers: s.workers,
            version_check_concurrency: self.http.version_check_concurrency,
            memory_limit: self.store.memory_limit.clone(),
            keep_work_dir: s.keep_work_dir,
            ..IngestConfig::default()
        }
    }

    pub fn transform_config(&self) -> TransformConfig {
        let s = &self.transform;
        TransformConfig {
            name: s.name.clone(),
            version: s.version.clone(),
            batch_size: s.batch_size,
            workers: s.workers,
            disabled_steps: s.disabled_steps.clone(),
            enrichment: self.enrichment.clone(),
            bulk: self.bulk_config(),
            ..TransformConfig::default()
        }
    }
}
