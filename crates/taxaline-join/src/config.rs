use std::path::PathBuf;

/// Configuration for the batched join engine.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Directory for the scratch DuckDB file (join.duckdb)
    pub work_dir: PathBuf,
    /// Core records per emitted batch
    pub batch_size: usize,
    /// DuckDB memory limit (e.g. "2GB")
    pub memory_limit: Option<String>,
}
