//! Enrichment index: conservation facts keyed by identifier and by
//! normalized scientific name, built once per run from reference collections.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taxaline_store::{Document, DocumentStore, StoreError};

use crate::taxon::{text_value, ConservationFact, TransformDoc};

/// Identifier fields, in preference order.
const ID_FIELDS: &[&str] = &["taxonID", "taxonId", "taxon_id", "speciesId", "acceptedNameUsageID"];
const NAME_FIELDS: &[&str] = &[
    "scientificName",
    "scientific_name",
    "canonicalName",
    "species",
    "commonName",
];
const CATEGORY_FIELDS: &[&str] = &["category", "threatStatus", "redListCategory", "status"];
const INVASIVE_FIELDS: &[&str] = &["invasive", "isInvasive"];
const AREA_FIELDS: &[&str] = &["protectedArea", "areaName", "siteName"];

/// A reference collection to index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentSource {
    /// Label stored on every fact from this source.
    pub name: String,
    pub collection: String,
}

/// Lowercase, alphanumerics only: `"Quercus alba"` -> `"quercusalba"`.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn first_text(doc: &Document, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .find_map(|f| doc.body.get(*f).and_then(text_value))
}

fn flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct EnrichmentIndex {
    facts: Vec<ConservationFact>,
    by_id: FxHashMap<String, Vec<usize>>,
    by_name: FxHashMap<String, Vec<usize>>,
}

impl EnrichmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every reference collection once and index its documents.
    pub fn build(store: &dyn DocumentStore, sources: &[EnrichmentSource]) -> Result<Self, StoreError> {
        let mut index = Self::new();
        for source in sources {
            let docs = store.find_all(&source.collection)?;
            let before = index.len();
            for doc in &docs {
                index.add_document(&source.name, doc);
            }
            log::info!(
                "Enrichment source {}: {} facts from {} documents",
                source.name,
                index.len() - before,
                docs.len()
            );
        }
        Ok(index)
    }

    /// Index one reference document under all its candidate keys.
    ///
    /// Documents with neither an identifier nor a name are ignored.
    pub fn add_document(&mut self, source: &str, doc: &Document) -> bool {
        let ids: Vec<String> = ID_FIELDS
            .iter()
            .filter_map(|f| doc.body.get(*f).and_then(text_value))
            .collect();
        let names: Vec<String> = NAME_FIELDS
            .iter()
            .filter_map(|f| doc.body.get(*f).and_then(text_value))
            .map(|n| normalize_name(&n))
            .filter(|n| !n.is_empty())
            .collect();
        if ids.is_empty() && names.is_empty() {
            return false;
        }

        let fact = ConservationFact {
            source: source.to_string(),
            reference_id: doc.id.clone(),
            category: first_text(doc, CATEGORY_FIELDS),
            invasive: INVASIVE_FIELDS
                .iter()
                .find_map(|f| doc.body.get(*f).and_then(flag)),
            protected_area: first_text(doc, AREA_FIELDS),
        };
        let idx = self.facts.len();
        self.facts.push(fact);
        for id in ids {
            push_unique(self.by_id.entry(id).or_default(), idx);
        }
        for name in names {
            push_unique(self.by_name.entry(name).or_default(), idx);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Facts matching any identifier or any name, each at most once, in
    /// index order.
    pub fn lookup<'a, I, N>(&self, ids: I, names: N) -> Vec<&ConservationFact>
    where
        I: IntoIterator<Item = &'a str>,
        N: IntoIterator<Item = &'a str>,
    {
        let mut hits = FxHashSet::default();
        for id in ids {
            if let Some(idx) = self.by_id.get(id) {
                hits.extend(idx.iter().copied());
            }
        }
        for name in names {
            if let Some(idx) = self.by_name.get(&normalize_name(name)) {
                hits.extend(idx.iter().copied());
            }
        }
        let mut hits: Vec<usize> = hits.into_iter().collect();
        hits.sort_unstable();
        hits.into_iter().map(|i| &self.facts[i]).collect()
    }

    /// Facts for a document being transformed: its local id, its raw
    /// identifier fields, and its scientific and canonical names.
    pub fn lookup_doc(&self, doc: &TransformDoc) -> Vec<&ConservationFact> {
        let mut ids: Vec<String> = vec![doc.taxon.source.record_id.clone()];
        ids.extend(ID_FIELDS.iter().filter_map(|f| doc.text(f)));
        let taxon = &doc.taxon;
        let names = std::iter::once(taxon.scientific_name.as_str())
            .chain(taxon.canonical_name.as_deref());
        self.lookup(ids.iter().map(String::as_str), names)
    }
}

fn push_unique(slots: &mut Vec<usize>, idx: usize) {
    if slots.last() != Some(&idx) {
        slots.push(idx);
    }
}
