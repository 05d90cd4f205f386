//! SQL for the batched join.
//!
//! Layout:
//! - `core_stage(id, seq, body)`: every core row as loaded
//! - `core_rows(id, seq, body)`: one row per id, the first in file order
//! - `ext_{i}(core_id, seq, body)`: rows of the i-th extension file
//!
//! `body` is a JSON object serialized as text. Each batch query aggregates
//! extension rows only inside the batch's `[lo, hi]` id range.

pub const STAGING_TABLE: &str = "core_stage";

pub fn create_core_stage() -> &'static str {
    "CREATE TABLE core_stage (id VARCHAR NOT NULL, seq BIGINT NOT NULL, body VARCHAR NOT NULL)"
}

/// Keep the first row per id and drop the staging table.
pub fn build_core_rows() -> &'static str {
    "CREATE TABLE core_rows AS
       SELECT id, min(seq) AS seq, arg_min(body, seq) AS body
       FROM core_stage GROUP BY id;
     CREATE UNIQUE INDEX core_rows_id ON core_rows (id);
     DROP TABLE core_stage;"
}

pub fn ext_table(i: usize) -> String {
    format!("ext_{i}")
}

pub fn create_ext_table(i: usize) -> String {
    format!(
        "CREATE TABLE ext_{i} (core_id VARCHAR NOT NULL, seq BIGINT NOT NULL, body VARCHAR NOT NULL)"
    )
}

pub fn create_ext_index(i: usize) -> String {
    format!("CREATE INDEX ext_{i}_core ON ext_{i} (core_id)")
}

pub fn count_orphans(i: usize) -> String {
    format!(
        "SELECT count(*) FROM ext_{i} e
         WHERE NOT EXISTS (SELECT 1 FROM core_rows c WHERE c.id = e.core_id)"
    )
}

pub fn count_rows(table: &str) -> String {
    format!("SELECT count(*) FROM {table}")
}

/// Bounds of the next window: `(min id, max id, rows)` after the cursor.
///
/// Params: cursor, batch size.
pub fn batch_bounds() -> &'static str {
    "SELECT min(id), max(id), count(*) FROM (
       SELECT id FROM core_rows WHERE id > ? ORDER BY id LIMIT ?
     )"
}

/// One batch: core rows in `[lo, hi]` with each extension's rows
/// concatenated as comma-separated JSON objects in source order.
///
/// Params: `(lo, hi)` once per extension, then `(lo, hi)` for the core.
pub fn batch_query(extensions: usize) -> String {
    let mut cols = String::from("c.id, c.body");
    let mut joins = String::new();
    for i in 0..extensions {
        cols.push_str(&format!(", e{i}.agg"));
        joins.push_str(&format!(
            "\n LEFT JOIN (
                SELECT core_id, string_agg(body, ',' ORDER BY seq) AS agg
                FROM ext_{i} WHERE core_id BETWEEN ? AND ?
                GROUP BY core_id
              ) e{i} ON e{i}.core_id = c.id"
        ));
    }
    format!(
        "SELECT {cols}
         FROM core_rows c{joins}
         WHERE c.id BETWEEN ? AND ?
         ORDER BY c.id"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_query_binds_range_per_extension() {
        let sql = batch_query(2);
        assert_eq!(sql.matches('?').count(), 6);
        assert!(sql.contains("e0.agg, e1.agg"));
        assert!(sql.contains("FROM ext_1 WHERE core_id BETWEEN ? AND ?"));
    }

    #[test]
    fn batch_query_without_extensions() {
        let sql = batch_query(0);
        assert_eq!(sql.matches('?').count(), 2);
        assert!(!sql.contains("JOIN"));
    }
}
