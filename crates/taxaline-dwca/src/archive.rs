//! Archive download and extraction

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use taxaline_core::{download_to_file, retry_with_backoff, DownloadStats};
use zip::ZipArchive;

use crate::error::DwcaError;

/// Download an archive to `dest`, retrying transient failures.
///
/// The transfer aborts when no bytes arrive within the configured
/// inactivity timeout; a slow but steady download is never cut off.
pub fn download_archive(
    url: &str,
    dest: &Path,
    pb: &ProgressBar,
) -> Result<DownloadStats, DwcaError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| DwcaError::io(parent, e))?;
    }
    let label = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| url.to_string());
    let stats = retry_with_backoff(&label, pb, || download_to_file(url, dest, pb))?;
    log::debug!(
        "Downloaded {url}: {} bytes in {:.1}s",
        stats.bytes,
        stats.elapsed.as_secs_f64()
    );
    Ok(stats)
}

/// Extract every file of a zip archive under `out_dir`.
///
/// Entries with unsafe paths (absolute, or escaping via `..`) are skipped.
/// Returns the total number of uncompressed bytes written.
pub fn extract_zip(zip_path: &Path, out_dir: &Path) -> Result<u64, DwcaError> {
    let file = File::open(zip_path).map_err(|e| DwcaError::io(zip_path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| DwcaError::Zip(e.to_string()))?;
    fs::create_dir_all(out_dir).map_err(|e| DwcaError::io(out_dir, e))?;

    let mut total = 0u64;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| DwcaError::Zip(format!("entry {i}: {e}")))?;
        let Some(rel) = entry.enclosed_name() else {
            log::warn!("Skipping zip entry with unsafe path: {}", entry.name());
            continue;
        };
        let target = out_dir.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| DwcaError::io(&target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| DwcaError::io(parent, e))?;
        }
        let mut out = File::create(&target).map_err(|e| DwcaError::io(&target, e))?;
        total += io::copy(&mut entry, &mut out).map_err(|e| DwcaError::io(&target, e))?;
    }
    log::debug!(
        "Extracted {} entries ({total} bytes) from {}",
        archive.len(),
        zip_path.display()
    );
    Ok(total)
}

/// Directory holding `meta.xml`: `dir` itself or a single wrapping subdirectory.
pub fn find_archive_root(dir: &Path) -> Result<PathBuf, DwcaError> {
    if dir.join("meta.xml").is_file() {
        return Ok(dir.to_path_buf());
    }
    let entries = fs::read_dir(dir).map_err(|e| DwcaError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| DwcaError::io(dir, e))?.path();
        if path.is_dir() && path.join("meta.xml").is_file() {
            return Ok(path);
        }
    }
    Err(DwcaError::Manifest(format!("no meta.xml under {}", dir.display())))
}

/// Sum of data file sizes under an extracted archive, used to choose a join mode.
pub fn data_size(root: &Path, locations: impl IntoIterator<Item = impl AsRef<Path>>) -> u64 {
    locations
        .into_iter()
        .filter_map(|loc| fs::metadata(root.join(loc)).ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, body) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn extracts_and_finds_nested_root() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        write_zip(
            &zip_path,
            &[
                ("dwca/meta.xml", "<archive/>"),
                ("dwca/taxon.txt", "id\nT1\n"),
            ],
        );
        let out = dir.path().join("x");
        let bytes = extract_zip(&zip_path, &out).unwrap();
        assert_eq!(bytes, 10 + 6);
        let root = find_archive_root(&out).unwrap();
        assert_eq!(root, out.join("dwca"));
        assert_eq!(data_size(&root, ["taxon.txt", "missing.txt"]), 6);
    }

    #[test]
    fn corrupt_zip_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bad.zip");
        fs::write(&zip_path, b"not a zip").unwrap();
        let err = extract_zip(&zip_path, &dir.path().join("x")).unwrap_err();
        assert_eq!(err.category(), taxaline_core::ErrorCategory::Parse);
    }

    #[test]
    fn missing_meta_is_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            find_archive_root(dir.path()),
            Err(DwcaError::Manifest(_))
        ));
    }
}
