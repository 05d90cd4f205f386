//! Normalized taxon document and the working document steps pass along

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Back-reference from a normalized document to the raw one it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// Raw document id; the normalized document shares it.
    pub raw_id: String,
    pub provider_id: String,
    /// Provider-local record id.
    pub record_id: String,
    pub provider_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VernacularName {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurrence_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub establishment_means: Option<String>,
}

/// Conservation fact attached from a reference collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConservationFact {
    /// Reference source name (e.g. `redlist`).
    pub source: String,
    /// Id of the reference document.
    pub reference_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invasive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected_area: Option<String>,
}

/// Normalized taxon: the fields the pipeline inspects plus passthrough extras.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedTaxon {
    pub scientific_name: String,
    /// Scientific name without authorship, whitespace collapsed.
    pub canonical_name: Option<String>,
    pub authorship: Option<String>,
    pub rank: Option<String>,
    pub taxonomic_status: Option<String>,
    pub kingdom: Option<String>,
    pub phylum: Option<String>,
    pub class: Option<String>,
    pub order: Option<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
    pub accepted_name_usage_id: Option<String>,
    pub accepted_name: Option<String>,
    pub parent_name_usage_id: Option<String>,
    pub parent_name: Option<String>,
    #[serde(default)]
    pub vernacular_names: Vec<VernacularName>,
    #[serde(default)]
    pub distribution: Vec<DistributionEntry>,
    #[serde(default)]
    pub conservation: Vec<ConservationFact>,
    pub source: SourceRef,
    pub transform_version: String,
    /// Raw fields the pipeline does not interpret, passed through as-is.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// What the steps thread through: the raw fields (shared, never mutated)
/// and the taxon being built.
#[derive(Debug, Clone)]
pub struct TransformDoc {
    pub record: Arc<Map<String, Value>>,
    pub taxon: NormalizedTaxon,
}

impl TransformDoc {
    pub fn new(record: Map<String, Value>, source: SourceRef) -> Self {
        Self {
            record: Arc::new(record),
            taxon: NormalizedTaxon {
                source,
                ..NormalizedTaxon::default()
            },
        }
    }

    /// Non-blank string value of a raw field, trimmed.
    pub fn text(&self, key: &str) -> Option<String> {
        text_value(self.record.get(key)?)
    }

    /// Objects of an attached extension, if any.
    pub fn extension(&self, name: &str) -> &[Value] {
        match self.record.get(name) {
            Some(Value::Array(rows)) => rows,
            _ => &[],
        }
    }

    pub fn with_taxon(&self, taxon: NormalizedTaxon) -> Self {
        Self {
            record: Arc::clone(&self.record),
            taxon,
        }
    }
}

/// Trimmed non-empty string, also accepting numbers.
pub fn text_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
