//! taxaline-join: Bounded-memory batched join for very large archives
//!
//! Loads the core and extension files of an extracted archive into a
//! scratch DuckDB file, then yields core records with their extensions in
//! ascending id order, a fixed number per batch. Each batch aggregates
//! extension rows only within its own id range, so peak memory follows
//! the batch size rather than the archive size.

mod config;
mod sql;

pub use config::JoinConfig;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use duckdb::{params, params_from_iter, Connection};
use serde_json::{Map, Value};
use taxaline_dwca::row::{extension_row, for_each_line, key_of, row_object, ExtensionRow};
use taxaline_dwca::{FileSpec, JoinStats, JoinedRecord, Manifest};

/// A loaded archive, ready to be read back in batches.
pub struct BatchedJoin {
    conn: Connection,
    /// Extension name per `ext_{i}` table
    extensions: Vec<String>,
    batch_size: usize,
    query: String,
    stats: JoinStats,
}

impl BatchedJoin {
    /// Load every data file of the archive into the scratch database.
    pub fn load(dir: &Path, manifest: &Manifest, config: &JoinConfig) -> Result<Self> {
        fs::create_dir_all(&config.work_dir).with_context(|| {
            format!("Failed to create work dir: {}", config.work_dir.display())
        })?;
        let db = config.work_dir.join("join.duckdb");
        for stale in [db.clone(), db.with_extension("duckdb.wal")] {
            if stale.exists() {
                fs::remove_file(&stale)
                    .with_context(|| format!("Failed to remove {}", stale.display()))?;
            }
        }

        let conn = Connection::open(&db)
            .with_context(|| format!("Failed to open DuckDB at {}", db.display()))?;
        if let Some(limit) = &config.memory_limit {
            conn.execute_batch(&format!("SET memory_limit = '{}';", limit.replace('\'', "")))
                .context("Failed to configure DuckDB")?;
        }

        let mut stats = JoinStats::default();
        log::info!("Loading core file {}", manifest.core.location);
        load_core(&conn, dir, &manifest.core, &mut stats)?;

        let mut extensions = Vec::with_capacity(manifest.extensions.len());
        for (i, ext) in manifest.extensions.iter().enumerate() {
            log::info!("Loading extension {} ({})", ext.location, ext.extension_name());
            load_extension(&conn, dir, i, ext, &mut stats)?;
            extensions.push(ext.extension_name());
        }

        let engine = Self {
            query: sql::batch_query(extensions.len()),
            conn,
            extensions,
            batch_size: config.batch_size.max(1),
            stats,
        };
        log::info!(
            "Batched join ready: {} core records, {} extensions",
            engine.core_count()?,
            engine.extensions.len()
        );
        Ok(engine)
    }

    pub fn stats(&self) -> &JoinStats {
        &self.stats
    }

    pub fn core_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row(&sql::count_rows("core_rows"), [], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// Iterate all batches from the first id. Each call starts over.
    pub fn batches(&self) -> Batches<'_> {
        Batches {
            engine: self,
            cursor: String::new(),
            done: false,
        }
    }

    /// The batch of records whose ids sort directly after `after`.
    pub fn fetch_batch(&self, after: &str) -> Result<Vec<JoinedRecord>> {
        let (lo, hi, n): (Option<String>, Option<String>, i64) = self
            .conn
            .query_row(
                sql::batch_bounds(),
                params![after, self.batch_size as i64],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .context("Failed to compute batch bounds")?;
        let (Some(lo), Some(hi)) = (lo, hi) else {
            return Ok(Vec::new());
        };

        let mut bind: Vec<&str> = Vec::with_capacity(2 * self.extensions.len() + 2);
        for _ in 0..=self.extensions.len() {
            bind.push(&lo);
            bind.push(&hi);
        }

        let n_ext = self.extensions.len();
        let mut stmt = self.conn.prepare(&self.query).context("Failed to prepare batch query")?;
        let rows = stmt
            .query_map(params_from_iter(bind), |row| {
                let id: String = row.get(0)?;
                let body: String = row.get(1)?;
                let mut aggs = Vec::with_capacity(n_ext);
                for i in 0..n_ext {
                    aggs.push(row.get::<_, Option<String>>(2 + i)?);
                }
                Ok((id, body, aggs))
            })?
            .collect::<duckdb::Result<Vec<_>>>()
            .with_context(|| format!("Failed batch query for [{lo}, {hi}]"))?;

        let mut batch = Vec::with_capacity(rows.len());
        for (id, body, aggs) in rows {
            let fields: Map<String, Value> = serde_json::from_str(&body)
                .with_context(|| format!("Corrupt core body for {id}"))?;
            let mut record = JoinedRecord::new(id, fields);
            for (name, agg) in self.extensions.iter().zip(aggs) {
                let Some(agg) = agg else { continue };
                let ext_rows: Vec<Map<String, Value>> =
                    serde_json::from_str(&format!("[{agg}]"))
                        .with_context(|| format!("Corrupt {name} rows for {}", record.id))?;
                for r in ext_rows {
                    record.attach(name, r);
                }
            }
            batch.push(record);
        }
        if batch.len() as i64 != n {
            anyhow::bail!(
                "Batch [{lo}, {hi}] returned {} records, expected {n}",
                batch.len()
            );
        }
        Ok(batch)
    }
}

/// Batches in ascending id order. Ends on the first empty batch, or after
/// yielding an error.
pub struct Batches<'a> {
    engine: &'a BatchedJoin,
    cursor: String,
    done: bool,
}

impl Iterator for Batches<'_> {
    type Item = Result<Vec<JoinedRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.engine.fetch_batch(&self.cursor) {
            Ok(batch) => match batch.last() {
                Some(last) => {
                    self.cursor = last.id.clone();
                    Some(Ok(batch))
                }
                None => {
                    self.done = true;
                    None
                }
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn load_core(
    conn: &Connection,
    dir: &Path,
    spec: &FileSpec,
    stats: &mut JoinStats,
) -> Result<()> {
    conn.execute_batch(sql::create_core_stage())
        .context("Failed to create core staging table")?;
    let path = dir.join(&spec.location);
    {
        let mut app = conn.appender(sql::STAGING_TABLE)?;
        let mut seq = 0i64;
        for_each_line(&path, spec.header_lines, |_, cols| -> Result<()> {
            stats.core_rows += 1;
            let id = key_of(spec, cols);
            if id.is_empty() {
                stats.missing_ids += 1;
                return Ok(());
            }
            let body = serde_json::to_string(&row_object(spec, cols))?;
            app.append_row(params![id, seq, body])?;
            seq += 1;
            Ok(())
        })?;
        app.flush()?;
    }
    let staged: i64 = conn.query_row(&sql::count_rows(sql::STAGING_TABLE), [], |r| r.get(0))?;
    conn.execute_batch(sql::build_core_rows())
        .context("Failed to build core_rows")?;
    let unique: i64 = conn.query_row(&sql::count_rows("core_rows"), [], |r| r.get(0))?;
    stats.duplicate_ids = (staged - unique) as u64;
    Ok(())
}

fn load_extension(
    conn: &Connection,
    dir: &Path,
    i: usize,
    spec: &FileSpec,
    stats: &mut JoinStats,
) -> Result<()> {
    conn.execute_batch(&sql::create_ext_table(i))
        .with_context(|| format!("Failed to create {}", sql::ext_table(i)))?;
    let path = dir.join(&spec.location);
    let mut loaded = 0u64;
    {
        let mut app = conn.appender(&sql::ext_table(i))?;
        let mut seq = 0i64;
        for_each_line(&path, spec.header_lines, |_, cols| -> Result<()> {
            match extension_row(spec, cols) {
                ExtensionRow::Blank => stats.blank_extension_rows += 1,
                ExtensionRow::Row { core_id, values } => {
                    let body = serde_json::to_string(&values)?;
                    app.append_row(params![core_id, seq, body])?;
                    seq += 1;
                    loaded += 1;
                }
            }
            Ok(())
        })?;
        app.flush()?;
    }
    conn.execute_batch(&sql::create_ext_index(i))
        .with_context(|| format!("Failed to index {}", sql::ext_table(i)))?;

    let orphans: i64 = conn.query_row(&sql::count_orphans(i), [], |r| r.get(0))?;
    stats.orphan_extension_rows += orphans as u64;
    *stats.attached.entry(spec.extension_name()).or_insert(0) += loaded - orphans as u64;
    Ok(())
}
