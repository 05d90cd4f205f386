//! Where archives and their metadata come from

use std::path::Path;

use indicatif::ProgressBar;
use taxaline_core::{fetch_text, StreamError};
use taxaline_dwca::{download_archive, DwcaError};

/// Fetches provider metadata and archives.
pub trait ArchiveSource: Sync {
    /// Small metadata document, under a short absolute timeout.
    fn fetch_metadata(&self, url: &str) -> Result<String, StreamError>;

    /// Download an archive to `dest`. Returns bytes written.
    fn download(&self, url: &str, dest: &Path, pb: &ProgressBar) -> Result<u64, DwcaError>;
}

/// Providers reached over HTTP(S).
pub struct HttpSource;

impl ArchiveSource for HttpSource {
    fn fetch_metadata(&self, url: &str) -> Result<String, StreamError> {
        fetch_text(url)
    }

    fn download(&self, url: &str, dest: &Path, pb: &ProgressBar) -> Result<u64, DwcaError> {
        Ok(download_archive(url, dest, pb)?.bytes)
    }
}
