//! EML dataset metadata
//!
//! Providers publish a small EML document per resource. Its `packageId`
//! attribute encodes `{providerId}/{version}`; the `<dataset>` block
//! carries descriptive fields copied onto ingested records.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::error::DwcaError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMeta {
    pub package_id: Option<String>,
    pub version: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub pub_date: Option<String>,
    pub license: Option<String>,
}

/// Split `{providerId}/{version}` at the last slash.
pub fn split_package_id(package_id: &str) -> Option<(&str, &str)> {
    let (provider, version) = package_id.trim().rsplit_once('/')?;
    if provider.is_empty() || version.is_empty() {
        return None;
    }
    Some((provider, version))
}

/// Parse an EML document. Missing fields stay `None`.
pub fn parse_eml(xml: &str) -> Result<DatasetMeta, DwcaError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut meta = DatasetMeta::default();
    // element path below the root, by local name
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(DwcaError::xml)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"eml" && meta.package_id.is_none() {
                    for a in e.attributes().flatten() {
                        if a.key.local_name().as_ref() == b"packageId" {
                            let v = a.unescape_value().map_err(DwcaError::xml)?;
                            meta.package_id = Some(v.trim().to_string());
                        }
                    }
                }
                let in_dataset = path.last().is_some_and(|p| p == b"dataset");
                let text_field = match name.as_slice() {
                    b"title" if in_dataset && meta.title.is_none() => Some(&mut meta.title),
                    b"pubDate" if in_dataset => Some(&mut meta.pub_date),
                    _ => None,
                };
                if let Some(slot) = text_field {
                    let text = reader.read_text(e.name()).map_err(DwcaError::xml)?;
                    *slot = non_empty(&text);
                    continue;
                }
                if in_dataset && name == b"abstract" {
                    meta.abstract_text = read_paragraphs(&mut reader, b"abstract")?;
                    continue;
                }
                if in_dataset && name == b"intellectualRights" {
                    meta.license = read_paragraphs(&mut reader, b"intellectualRights")?;
                    continue;
                }
                path.push(name);
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    meta.version = meta
        .package_id
        .as_deref()
        .and_then(split_package_id)
        .map(|(_, v)| v.to_string());
    Ok(meta)
}

/// Collect all text under an element, joining `<para>` blocks with blank lines.
fn read_paragraphs(reader: &mut Reader<&[u8]>, end: &[u8]) -> Result<Option<String>, DwcaError> {
    let mut parts: Vec<String> = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(DwcaError::xml)? {
            Event::Text(t) => {
                let text = t.unescape().map_err(DwcaError::xml)?;
                let text = text.trim();
                if !text.is_empty() {
                    parts.push(text.to_string());
                }
            }
            Event::End(e) if e.local_name().as_ref() == end => break,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(non_empty(&parts.join("\n\n")))
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
