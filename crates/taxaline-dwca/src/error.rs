use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use taxaline_core::{categorize_io, ErrorCategory, StreamError};

/// Errors reading, fetching, or unpacking an archive.
#[derive(Debug)]
pub enum DwcaError {
    Io { path: PathBuf, source: io::Error },
    /// Descriptor is not well-formed XML.
    Xml(String),
    /// Descriptor parsed but lacks something the join needs.
    Manifest(String),
    Zip(String),
    Fetch(StreamError),
}

impl DwcaError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn xml(e: impl fmt::Display) -> Self {
        Self::Xml(e.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io { source, .. } => categorize_io(source),
            Self::Xml(_) | Self::Manifest(_) | Self::Zip(_) => ErrorCategory::Parse,
            Self::Fetch(e) => e.category(),
        }
    }
}

impl fmt::Display for DwcaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Xml(msg) => write!(f, "XML: {msg}"),
            Self::Manifest(msg) => write!(f, "manifest: {msg}"),
            Self::Zip(msg) => write!(f, "zip: {msg}"),
            Self::Fetch(e) => write!(f, "fetch: {e}"),
        }
    }
}

impl std::error::Error for DwcaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Fetch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StreamError> for DwcaError {
    fn from(e: StreamError) -> Self {
        Self::Fetch(e)
    }
}
