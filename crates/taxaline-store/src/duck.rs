//! DuckDB-backed document store
//!
//! One table per collection:
//! ```text
//! doc_{collection}(id VARCHAR PRIMARY KEY, part VARCHAR, version VARCHAR, body VARCHAR)
//! ```
//! Bodies are stored as JSON text; nothing here depends on DuckDB's JSON
//! extension.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use duckdb::{params, Connection, Row};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};

use crate::document::{Document, StoreError, StoreLimits, WriteSummary};
use crate::store::{validate_collection, ConditionalWrite, DocumentStore, WriteGuard};

struct Inner {
    conn: Connection,
    tables: FxHashSet<String>,
}

/// [`DocumentStore`] over a single DuckDB database file.
///
/// All access is serialized through one connection, which is what makes
/// [`DocumentStore::replace_if`] atomic for every thread of the process.
pub struct DuckStore {
    inner: Mutex<Inner>,
    limits: StoreLimits,
}

impl DuckStore {
    /// Open (or create) a database file.
    pub fn open(path: &Path, memory_limit: Option<&str>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        if let Some(limit) = memory_limit {
            conn.execute_batch(&format!("SET memory_limit = '{}';", limit.replace('\'', "")))?;
        }
        log::debug!("Opened document store at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            inner: Mutex::new(Inner {
                conn,
                tables: FxHashSet::default(),
            }),
            limits: StoreLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    /// Table name for a collection, creating the table on first use.
    fn table(&mut self, collection: &str) -> Result<String, StoreError> {
        validate_collection(collection)?;
        let table = format!("doc_{collection}");
        if !self.tables.contains(&table) {
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id VARCHAR PRIMARY KEY,
                    part VARCHAR,
                    version VARCHAR,
                    body VARCHAR NOT NULL
                );"
            ))?;
            self.tables.insert(table.clone());
        }
        Ok(table)
    }
}

const COLUMNS: &str = "id, part, version, body";

fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} ({COLUMNS}) VALUES (?, ?, ?, ?)
         ON CONFLICT (id) DO UPDATE SET
           part = excluded.part, version = excluded.version, body = excluded.body"
    )
}

/// Raw row tuple; JSON decoding happens outside the driver callback.
type RawRow = (String, Option<String>, Option<String>, String);

fn raw_row(row: &Row<'_>) -> duckdb::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_document((id, partition, version, body): RawRow) -> Result<Document, StoreError> {
    let body: Map<String, Value> = serde_json::from_str(&body)?;
    Ok(Document {
        id,
        partition,
        version,
        body,
    })
}

fn collect_rows(rows: Vec<RawRow>) -> Result<Vec<Document>, StoreError> {
    rows.into_iter().map(into_document).collect()
}

fn query_docs(
    conn: &Connection,
    sql: &str,
    params: impl duckdb::Params,
) -> Result<Vec<Document>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, raw_row)?
        .collect::<duckdb::Result<Vec<_>>>()?;
    collect_rows(rows)
}

fn exists(conn: &Connection, table: &str, id: &str) -> Result<bool, StoreError> {
    let n: i64 = conn.query_row(
        &format!("SELECT count(*) FROM {table} WHERE id = ?"),
        [id],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

fn find(conn: &Connection, table: &str, id: &str) -> Result<Option<Document>, StoreError> {
    let mut docs = query_docs(
        conn,
        &format!("SELECT {COLUMNS} FROM {table} WHERE id = ?"),
        [id],
    )?;
    Ok(docs.pop())
}

fn upsert(conn: &Connection, table: &str, doc: &Document) -> Result<(), StoreError> {
    conn.execute(
        &upsert_sql(table),
        params![doc.id, doc.partition, doc.version, doc.body_json()?],
    )?;
    Ok(())
}

impl DocumentStore for DuckStore {
    fn limits(&self) -> StoreLimits {
        self.limits
    }

    fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let mut inner = self.lock();
        let table = inner.table(collection)?;
        find(&inner.conn, &table, id)
    }

    fn find_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let mut inner = self.lock();
        let table = inner.table(collection)?;
        query_docs(
            &inner.conn,
            &format!("SELECT {COLUMNS} FROM {table} ORDER BY id"),
            [],
        )
    }

    fn scan_after(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let mut inner = self.lock();
        let table = inner.table(collection)?;
        // ids are never empty, so "" sorts before every stored key
        query_docs(
            &inner.conn,
            &format!("SELECT {COLUMNS} FROM {table} WHERE id > ? ORDER BY id LIMIT ?"),
            params![after.unwrap_or(""), limit as i64],
        )
    }

    fn ids_with_version(
        &self,
        collection: &str,
        version: &str,
    ) -> Result<FxHashSet<String>, StoreError> {
        let mut inner = self.lock();
        let table = inner.table(collection)?;
        let mut stmt = inner
            .conn
            .prepare(&format!("SELECT id FROM {table} WHERE version = ?"))?;
        let ids = stmt
            .query_map([version], |r| r.get::<_, String>(0))?
            .collect::<duckdb::Result<FxHashSet<_>>>()?;
        Ok(ids)
    }

    fn count_with_version(&self, collection: &str, version: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let table = inner.table(collection)?;
        let n: i64 = inner.conn.query_row(
            &format!("SELECT count(*) FROM {table} WHERE version = ?"),
            [version],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let table = inner.table(collection)?;
        let n: i64 = inner
            .conn
            .query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(n as u64)
    }

    fn upsert_many(
        &self,
        collection: &str,
        docs: &[Document],
    ) -> Result<WriteSummary, StoreError> {
        self.limits.check_batch(docs)?;
        if docs.is_empty() {
            return Ok(WriteSummary::default());
        }

        // DuckDB refuses to touch one key twice in a transaction; last write wins
        let mut last: FxHashMap<&str, usize> = FxHashMap::default();
        for (i, doc) in docs.iter().enumerate() {
            last.insert(doc.id.as_str(), i);
        }

        let mut inner = self.lock();
        let table = inner.table(collection)?;
        let tx = inner.conn.transaction()?;
        let mut summary = WriteSummary::default();
        for (i, doc) in docs.iter().enumerate() {
            if last.get(doc.id.as_str()) != Some(&i) {
                summary.updated += 1;
                continue;
            }
            if exists(&tx, &table, &doc.id)? {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
            upsert(&tx, &table, doc)?;
        }
        tx.commit()?;
        Ok(summary)
    }

    fn insert_one(&self, collection: &str, doc: &Document) -> Result<(), StoreError> {
        self.limits.check_batch(std::slice::from_ref(doc))?;
        let mut inner = self.lock();
        let table = inner.table(collection)?;
        inner.conn.execute(
            &format!("INSERT INTO {table} ({COLUMNS}) VALUES (?, ?, ?, ?)"),
            params![doc.id, doc.partition, doc.version, doc.body_json()?],
        )?;
        Ok(())
    }

    fn replace_if(
        &self,
        collection: &str,
        guard: &WriteGuard<'_>,
        doc: &Document,
    ) -> Result<ConditionalWrite, StoreError> {
        self.limits.check_batch(std::slice::from_ref(doc))?;
        let mut inner = self.lock();
        let table = inner.table(collection)?;
        let tx = inner.conn.transaction()?;
        let current = find(&tx, &table, &doc.id)?;
        if !guard(current.as_ref()) {
            tx.rollback()?;
            return Ok(ConditionalWrite::Rejected(current));
        }
        upsert(&tx, &table, doc)?;
        tx.commit()?;
        Ok(ConditionalWrite::Written)
    }

    fn delete_superseded(
        &self,
        collection: &str,
        partition: &str,
        keep_version: &str,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let table = inner.table(collection)?;
        let n = inner.conn.execute(
            &format!(
                "DELETE FROM {table} WHERE part = ? AND (version IS NULL OR version <> ?)"
            ),
            params![partition, keep_version],
        )?;
        Ok(n as u64)
    }
}
