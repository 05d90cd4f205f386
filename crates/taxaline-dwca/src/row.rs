//! Line-level parsing shared by the streaming joiner and the batched engine
//!
//! Both join paths go through these functions so they agree on every
//! edge case: header skipping, empty cells, JSON cells, blank extension
//! rows.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::DwcaError;
use crate::manifest::FileSpec;

/// Split a raw line on tabs, dropping the line terminator.
pub fn split_line(line: &str) -> Vec<&str> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    line.split('\t').collect()
}

/// Cell value, or `None` for an empty cell.
///
/// Cells starting with `{` are decoded as JSON when they parse; otherwise
/// the text is kept as-is.
pub fn parse_value(raw: &str) -> Option<Value> {
    if raw.trim().is_empty() {
        return None;
    }
    if raw.starts_with('{') {
        if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(raw) {
            return Some(v);
        }
    }
    Some(Value::String(raw.to_string()))
}

/// Build a row object from the configured fields.
///
/// Columns past the end of a short line are simply absent.
pub fn row_object(spec: &FileSpec, cols: &[&str]) -> Map<String, Value> {
    let mut obj = Map::new();
    for field in &spec.fields {
        let value = field
            .index
            .and_then(|i| cols.get(i))
            .and_then(|raw| parse_value(raw))
            .or_else(|| field.default.as_ref().map(|d| Value::String(d.clone())));
        if let Some(v) = value {
            obj.insert(field.name.clone(), v);
        }
    }
    obj
}

/// Key column of a row, trimmed. Empty when missing.
pub fn key_of<'a>(spec: &FileSpec, cols: &[&'a str]) -> &'a str {
    cols.get(spec.key_index).map_or("", |k| k.trim())
}

/// Classification of one extension line.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionRow {
    /// Every non-key column is empty.
    Blank,
    Row {
        core_id: String,
        values: Map<String, Value>,
    },
}

pub fn extension_row(spec: &FileSpec, cols: &[&str]) -> ExtensionRow {
    let has_content = cols
        .iter()
        .enumerate()
        .any(|(i, c)| i != spec.key_index && !c.trim().is_empty());
    if !has_content {
        return ExtensionRow::Blank;
    }
    ExtensionRow::Row {
        core_id: key_of(spec, cols).to_string(),
        values: row_object(spec, cols),
    }
}

/// Stream the data lines of `path`, after its header lines.
///
/// The callback gets the 1-based line number and the split columns. A
/// final line without a newline is still delivered. Invalid UTF-8 is
/// replaced rather than aborting the file.
pub fn for_each_line<F, E>(path: &Path, header_lines: usize, mut f: F) -> Result<u64, E>
where
    F: FnMut(u64, &[&str]) -> Result<(), E>,
    E: From<DwcaError>,
{
    let file = File::open(path).map_err(|e| DwcaError::io(path, e))?;
    let mut reader = BufReader::with_capacity(256 * 1024, file);
    let mut buf = Vec::with_capacity(4096);
    let mut line_no = 0u64;
    let mut delivered = 0u64;
    let skip = header_lines.max(1) as u64;

    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| DwcaError::io(path, e))?;
        if n == 0 {
            break;
        }
        line_no += 1;
        if line_no <= skip {
            continue;
        }
        let line = String::from_utf8_lossy(&buf);
        let cols = split_line(&line);
        if cols.len() == 1 && cols[0].is_empty() {
            continue;
        }
        f(line_no, &cols)?;
        delivered += 1;
    }
    Ok(delivered)
}
