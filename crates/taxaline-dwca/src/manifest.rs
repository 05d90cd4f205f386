//! `meta.xml` descriptor parsing
//!
//! Field order is positional: a field's `index` is the column it occupies
//! in the physical file. Names come from the term URI and are only used
//! as output keys.

use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::DwcaError;

/// One configured column (or constant) of a data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Column position; `None` for constant-only fields.
    pub index: Option<usize>,
    pub term: String,
    /// Output key: the term's last path or fragment segment.
    pub name: String,
    /// Value used when the column is absent or empty.
    pub default: Option<String>,
}

/// A core or extension data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub row_type: String,
    /// Path relative to the archive root.
    pub location: String,
    /// `<id index>` for the core, `<coreid index>` for extensions.
    pub key_index: usize,
    pub fields: Vec<FieldSpec>,
    pub header_lines: usize,
}

impl FileSpec {
    /// Name of the array property an extension contributes to each record.
    ///
    /// The row type's local name with a lowercase first letter
    /// (`.../VernacularName` becomes `vernacularName`), falling back to the
    /// file stem.
    pub fn extension_name(&self) -> String {
        let local = term_name(&self.row_type);
        if !local.is_empty() {
            return lower_first(local);
        }
        Path::new(&self.location)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.location.clone())
    }
}

/// Parsed descriptor: one core file and its extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub core: FileSpec,
    pub extensions: Vec<FileSpec>,
}

impl Manifest {
    /// Read `meta.xml` from an extracted archive directory.
    pub fn read_from(dir: &Path) -> Result<Self, DwcaError> {
        let path = dir.join("meta.xml");
        let xml = std::fs::read_to_string(&path).map_err(|e| DwcaError::io(&path, e))?;
        Self::parse(&xml)
    }

    pub fn parse(xml: &str) -> Result<Self, DwcaError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut core = None;
        let mut extensions = Vec::new();
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf).map_err(DwcaError::xml)? {
                Event::Start(e) if e.local_name().as_ref() == b"core" => {
                    if core.is_some() {
                        return Err(DwcaError::Manifest("more than one <core> element".into()));
                    }
                    core = Some(parse_file(&mut reader, &e, b"core")?);
                }
                Event::Start(e) if e.local_name().as_ref() == b"extension" => {
                    extensions.push(parse_file(&mut reader, &e, b"extension")?);
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        let core = core.ok_or_else(|| DwcaError::Manifest("no <core> element".into()))?;
        Ok(Self { core, extensions })
    }
}

/// Parse one `<core>` or `<extension>` block up to its end tag.
fn parse_file(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    tag: &[u8],
) -> Result<FileSpec, DwcaError> {
    let kind = if tag == b"core" { "core" } else { "extension" };
    let key_tag: &[u8] = if tag == b"core" { b"id" } else { b"coreid" };

    let row_type = attr(start, b"rowType")?.unwrap_or_default();
    let header_lines = attr(start, b"ignoreHeaderLines")?
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(1);

    let mut location = None;
    let mut key_index = None;
    let mut fields = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let (e, empty) = match reader.read_event_into(&mut buf).map_err(DwcaError::xml)? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(e) if e.local_name().as_ref() == tag => break,
            Event::Eof => {
                return Err(DwcaError::Manifest(format!("unterminated <{kind}> element")));
            }
            _ => continue,
        };
        match e.local_name().as_ref() {
            b"location" if !empty => {
                let text = reader.read_text(e.name()).map_err(DwcaError::xml)?;
                let text = text.trim();
                if location.is_none() && !text.is_empty() {
                    location = Some(text.to_string());
                }
            }
            name if name == key_tag => {
                key_index = attr(&e, b"index")?.and_then(|v| v.trim().parse().ok());
            }
            b"field" => {
                let term = attr(&e, b"term")?.unwrap_or_default();
                if term.is_empty() {
                    log::debug!("Skipping {kind} field without term");
                    continue;
                }
                fields.push(FieldSpec {
                    index: attr(&e, b"index")?.and_then(|v| v.trim().parse().ok()),
                    name: term_name(&term).to_string(),
                    term,
                    default: attr(&e, b"default")?,
                });
            }
            _ => {}
        }
    }

    let location = location
        .ok_or_else(|| DwcaError::Manifest(format!("{kind} '{row_type}' has no <location>")))?;
    let key_index = key_index.ok_or_else(|| {
        DwcaError::Manifest(format!(
            "{kind} '{location}' has no <{}> index",
            String::from_utf8_lossy(key_tag)
        ))
    })?;

    Ok(FileSpec {
        row_type,
        location,
        key_index,
        fields,
        header_lines,
    })
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, DwcaError> {
    for a in e.attributes().flatten() {
        if a.key.local_name().as_ref() == key {
            return Ok(Some(a.unescape_value().map_err(DwcaError::xml)?.into_owned()));
        }
    }
    Ok(None)
}

/// Last segment of a term URI: `http://rs.tdwg.org/dwc/terms/taxonID` -> `taxonID`.
pub fn term_name(term: &str) -> &str {
    let trimmed = term.trim_end_matches(['/', '#']);
    match trimmed.rfind(['/', '#']) {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
