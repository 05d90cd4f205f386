//! taxaline-dwca: Darwin Core Archive reading
//!
//! Parses the `meta.xml` descriptor, streams the tab-delimited core and
//! extension files into joined records, and handles archive download,
//! extraction, and EML metadata.

pub mod archive;
pub mod eml;
mod error;
pub mod joiner;
pub mod manifest;
pub mod record;
pub mod row;

pub use archive::{data_size, download_archive, extract_zip, find_archive_root};
pub use eml::{parse_eml, split_package_id, DatasetMeta};
pub use error::DwcaError;
pub use joiner::{join_archive, read_archive, JoinStats, JoinedArchive};
pub use manifest::{FieldSpec, FileSpec, Manifest};
pub use record::JoinedRecord;
