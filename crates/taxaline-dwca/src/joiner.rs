//! Streaming line joiner
//!
//! Core rows are read line by line into records; extension files are then
//! streamed and each row is appended to its owning record. Only the joined
//! output is held in memory, never a whole source file.

use std::collections::BTreeMap;
use std::path::Path;

use rustc_hash::FxHashMap;

use crate::error::DwcaError;
use crate::manifest::{FileSpec, Manifest};
use crate::record::JoinedRecord;
use crate::row::{extension_row, for_each_line, key_of, row_object, ExtensionRow};

/// Counters from one join, shared by both join paths.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinStats {
    pub core_rows: u64,
    /// Core rows without an identifier.
    pub missing_ids: u64,
    /// Core rows whose identifier was already seen; the first row wins.
    pub duplicate_ids: u64,
    /// Extension name -> rows attached to a record.
    pub attached: BTreeMap<String, u64>,
    pub blank_extension_rows: u64,
    /// Extension rows whose key matched no core record.
    pub orphan_extension_rows: u64,
}

impl JoinStats {
    pub fn log(&self) {
        log::info!(
            "Joined {} core rows ({} missing id, {} duplicate)",
            self.core_rows,
            self.missing_ids,
            self.duplicate_ids
        );
        for (name, n) in &self.attached {
            log::info!("  {name}: {n} rows attached");
        }
        if self.orphan_extension_rows > 0 {
            log::warn!(
                "{} orphan extension rows dropped",
                self.orphan_extension_rows
            );
        }
    }
}

/// Records of one archive in core-file order, with an id index.
#[derive(Debug, Default)]
pub struct JoinedArchive {
    records: Vec<JoinedRecord>,
    index: FxHashMap<String, usize>,
    pub stats: JoinStats,
}

impl JoinedArchive {
    pub fn get(&self, id: &str) -> Option<&JoinedRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JoinedRecord> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<JoinedRecord> {
        self.records
    }
}

/// Read the manifest and join every data file of an extracted archive.
pub fn read_archive(dir: &Path) -> Result<(Manifest, JoinedArchive), DwcaError> {
    let manifest = Manifest::read_from(dir)?;
    let joined = join_archive(dir, &manifest)?;
    Ok((manifest, joined))
}

pub fn join_archive(dir: &Path, manifest: &Manifest) -> Result<JoinedArchive, DwcaError> {
    let mut out = JoinedArchive::default();
    load_core(dir, &manifest.core, &mut out)?;
    for ext in &manifest.extensions {
        attach_extension(dir, ext, &mut out)?;
    }
    Ok(out)
}

fn load_core(dir: &Path, spec: &FileSpec, out: &mut JoinedArchive) -> Result<(), DwcaError> {
    let path = dir.join(&spec.location);
    let JoinedArchive {
        records,
        index,
        stats,
    } = out;
    for_each_line(&path, spec.header_lines, |line_no, cols| -> Result<(), DwcaError> {
        stats.core_rows += 1;
        let id = key_of(spec, cols);
        if id.is_empty() {
            log::debug!("{}:{line_no}: core row without id", spec.location);
            stats.missing_ids += 1;
            return Ok(());
        }
        if index.contains_key(id) {
            stats.duplicate_ids += 1;
            return Ok(());
        }
        index.insert(id.to_string(), records.len());
        records.push(JoinedRecord::new(id, row_object(spec, cols)));
        Ok(())
    })?;
    log::debug!("Loaded {} core records from {}", records.len(), spec.location);
    Ok(())
}

fn attach_extension(
    dir: &Path,
    spec: &FileSpec,
    out: &mut JoinedArchive,
) -> Result<(), DwcaError> {
    let path = dir.join(&spec.location);
    let name = spec.extension_name();
    let JoinedArchive {
        records,
        index,
        stats,
    } = out;
    let mut attached = 0u64;
    for_each_line(&path, spec.header_lines, |_, cols| -> Result<(), DwcaError> {
        match extension_row(spec, cols) {
            ExtensionRow::Blank => stats.blank_extension_rows += 1,
            ExtensionRow::Row { core_id, values } => match index.get(core_id.as_str()) {
                Some(&i) => {
                    records[i].attach(&name, values);
                    attached += 1;
                }
                None => stats.orphan_extension_rows += 1,
            },
        }
        Ok(())
    })?;
    *stats.attached.entry(name).or_insert(0) += attached;
    Ok(())
}
