//! Taxon normalization steps and the default pipeline built from them

use serde_json::{Map, Value};
use taxaline_store::{collections, record_id, DocumentStore, RunMetrics};

use crate::enrich::EnrichmentIndex;
use crate::pipeline::{Pipeline, StepError, StepResult};
use crate::taxon::{text_value, DistributionEntry, NormalizedTaxon, TransformDoc, VernacularName};

/// Histogram key for related ids that resolve to no raw record.
pub const RELATED_NAME_MISSING: &str = "relatedNameMissing";

/// Raw fields copied into [`NormalizedTaxon`]; everything else is passthrough.
const KNOWN_TERMS: &[&str] = &[
    "taxonID",
    "scientificName",
    "scientificNameAuthorship",
    "taxonRank",
    "taxonomicStatus",
    "kingdom",
    "phylum",
    "class",
    "order",
    "family",
    "genus",
    "acceptedNameUsageID",
    "parentNameUsageID",
    VERNACULAR,
    DISTRIBUTION,
];
const VERNACULAR: &str = "vernacularName";
const DISTRIBUTION: &str = "distribution";

/// Everything a step may consult besides the document itself.
pub struct StepContext<'a> {
    pub store: &'a dyn DocumentStore,
    pub index: &'a EnrichmentIndex,
    pub metrics: &'a RunMetrics,
    pub version: &'a str,
}

/// The standard normalization sequence.
pub fn taxon_pipeline<'a>() -> Pipeline<TransformDoc, StepContext<'a>> {
    Pipeline::new()
        .step("requireName", |doc, _| Ok(require_name(doc)))
        .step("buildCore", |doc, _| Ok(Some(build_core(doc))))
        .step("cleanName", |doc, _| Ok(clean_name(doc)))
        .optional_step("vernacularNames", |doc, _| Ok(vernacular_names(doc)))
        .optional_step("distribution", |doc, _| Ok(distribution(doc)))
        .optional_step("relatedNames", related_names)
        .optional_step("enrich", |doc, ctx| Ok(enrich(doc, ctx.index)))
        .step("stampVersion", |doc, ctx| Ok(Some(stamp_version(doc, ctx.version))))
}

fn require_name(doc: &TransformDoc) -> Option<TransformDoc> {
    if doc.taxon.source.record_id.trim().is_empty() {
        return None;
    }
    doc.text("scientificName")?;
    Some(doc.clone())
}

fn lower(v: Option<String>) -> Option<String> {
    v.map(|s| s.to_lowercase())
}

fn build_core(doc: &TransformDoc) -> TransformDoc {
    let extra: Map<String, Value> = doc
        .record
        .iter()
        .filter(|(k, _)| !KNOWN_TERMS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let taxon = NormalizedTaxon {
        scientific_name: collapse_whitespace(&doc.text("scientificName").unwrap_or_default()),
        authorship: doc.text("scientificNameAuthorship"),
        rank: lower(doc.text("taxonRank")),
        taxonomic_status: lower(doc.text("taxonomicStatus")),
        kingdom: doc.text("kingdom"),
        phylum: doc.text("phylum"),
        class: doc.text("class"),
        order: doc.text("order"),
        family: doc.text("family"),
        genus: doc.text("genus"),
        accepted_name_usage_id: doc.text("acceptedNameUsageID"),
        parent_name_usage_id: doc.text("parentNameUsageID"),
        source: doc.taxon.source.clone(),
        extra,
        ..NormalizedTaxon::default()
    };
    doc.with_taxon(taxon)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Scientific name without trailing authorship. `None` when nothing is left.
fn canonical_name(scientific: &str, authorship: Option<&str>) -> Option<String> {
    let mut name = scientific;
    if let Some(author) = authorship.map(str::trim).filter(|a| !a.is_empty()) {
        if let Some(stripped) = name.strip_suffix(author) {
            name = stripped;
        }
    }
    let name = collapse_whitespace(name);
    (!name.is_empty()).then_some(name)
}

fn clean_name(doc: &TransformDoc) -> Option<TransformDoc> {
    let canonical = canonical_name(&doc.taxon.scientific_name, doc.taxon.authorship.as_deref())?;
    let mut taxon = doc.taxon.clone();
    taxon.canonical_name = Some(canonical);
    Some(doc.with_taxon(taxon))
}

fn field(row: &Map<String, Value>, key: &str) -> Option<String> {
    row.get(key).and_then(text_value)
}

fn vernacular_names(doc: &TransformDoc) -> Option<TransformDoc> {
    let mut names: Vec<VernacularName> = Vec::new();
    for row in doc.extension(VERNACULAR).iter().filter_map(Value::as_object) {
        let Some(name) = field(row, "vernacularName") else {
            continue;
        };
        let entry = VernacularName {
            name: collapse_whitespace(&name),
            language: lower(field(row, "language")),
            country_code: field(row, "countryCode").map(|c| c.to_uppercase()),
        };
        let duplicate = names.iter().any(|n| {
            n.language == entry.language && n.name.to_lowercase() == entry.name.to_lowercase()
        });
        if !duplicate {
            names.push(entry);
        }
    }
    if names.is_empty() {
        return None;
    }
    let mut taxon = doc.taxon.clone();
    taxon.vernacular_names = names;
    Some(doc.with_taxon(taxon))
}

fn distribution(doc: &TransformDoc) -> Option<TransformDoc> {
    let entries: Vec<DistributionEntry> = doc
        .extension(DISTRIBUTION)
        .iter()
        .filter_map(Value::as_object)
        .map(|row| DistributionEntry {
            locality: field(row, "locality"),
            country_code: field(row, "countryCode").map(|c| c.to_uppercase()),
            occurrence_status: lower(field(row, "occurrenceStatus")),
            establishment_means: lower(field(row, "establishmentMeans")),
        })
        .filter(|e| e.locality.is_some() || e.country_code.is_some())
        .collect();
    if entries.is_empty() {
        return None;
    }
    let mut taxon = doc.taxon.clone();
    taxon.distribution = entries;
    Some(doc.with_taxon(taxon))
}

/// Scientific name of another record from the same provider.
fn related_scientific_name(
    store: &dyn DocumentStore,
    provider_id: &str,
    local_id: &str,
) -> Result<Option<String>, StepError> {
    let id = record_id(provider_id, local_id);
    let doc = store
        .find_one(collections::RAW, &id)
        .map_err(|e| StepError::new(format!("related lookup {local_id}: {e}")))?;
    Ok(doc.and_then(|d| {
        d.body
            .get("record")
            .and_then(|r| r.get("scientificName"))
            .and_then(text_value)
    }))
}

/// Backfill accepted and parent names. An id that resolves to no record
/// leaves the name empty and is counted under [`RELATED_NAME_MISSING`].
fn related_names(doc: &TransformDoc, ctx: &StepContext<'_>) -> StepResult<TransformDoc> {
    let taxon = &doc.taxon;
    let provider = &taxon.source.provider_id;
    let own_id = &taxon.source.record_id;
    let resolve = |id: &Option<String>| -> Result<Option<String>, StepError> {
        match id {
            Some(id) if id != own_id => {
                let name = related_scientific_name(ctx.store, provider, id)?;
                if name.is_none() {
                    log::debug!("{provider}/{own_id}: related id {id} not found");
                    ctx.metrics.record_error(RELATED_NAME_MISSING);
                }
                Ok(name)
            }
            Some(_) => Ok(Some(taxon.scientific_name.clone())),
            None => Ok(None),
        }
    };
    let accepted = resolve(&taxon.accepted_name_usage_id)?;
    let parent = resolve(&taxon.parent_name_usage_id)?;
    if accepted.is_none() && parent.is_none() {
        return Ok(None);
    }
    let mut taxon = taxon.clone();
    taxon.accepted_name = accepted;
    taxon.parent_name = parent;
    Ok(Some(doc.with_taxon(taxon)))
}

fn enrich(doc: &TransformDoc, index: &EnrichmentIndex) -> Option<TransformDoc> {
    let facts = index.lookup_doc(doc);
    if facts.is_empty() {
        return None;
    }
    let mut taxon = doc.taxon.clone();
    taxon.conservation = facts.into_iter().cloned().collect();
    Some(doc.with_taxon(taxon))
}

fn stamp_version(doc: &TransformDoc, version: &str) -> TransformDoc {
    let mut taxon = doc.taxon.clone();
    taxon.transform_version = version.to_string();
    doc.with_taxon(taxon)
}
