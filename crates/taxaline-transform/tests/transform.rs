use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use taxaline_core::ProgressContext;
use taxaline_ingest::{RawRecord, SourceMeta};
use taxaline_store::{
    collections, record_id, resource_name, Document, DocumentStore, DuckStore, LockConfig,
    LockManager, MetricsSnapshot, RunOutcome, StoreLimits,
};
use taxaline_transform::{
    EnrichmentSource, TransformConfig, Transformer, RAW_STATUS_TOO_LARGE, RELATED_NAME_MISSING,
};
use tempfile::TempDir;

fn object(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => panic!("expected an object"),
    }
}

fn raw(local_id: &str, record: Value) -> Document {
    raw_at(local_id, "2024-1", record)
}

/// Raw document as ingestion writes it for one provider version.
fn raw_at(local_id: &str, provider_version: &str, record: Value) -> Document {
    let source = SourceMeta {
        provider_id: "kbif".into(),
        version: provider_version.into(),
        ingested_at: Utc::now(),
        archive_url: "http://kbif.example/dwca.zip".into(),
        dataset_title: Some("Flora".into()),
    };
    let raw = RawRecord {
        local_id: local_id.into(),
        record: object(record),
        source,
        status: Default::default(),
    };
    raw.to_document().unwrap()
}

struct Harness {
    _tmp: TempDir,
    store: Arc<DuckStore>,
    locks: LockManager,
    progress: ProgressContext,
}

impl Harness {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(DuckStore::open(&tmp.path().join("taxaline.duckdb"), None).unwrap());
        store
            .upsert_many(
                collections::RAW,
                &[
                    raw(
                        "T1",
                        json!({
                            "taxonID": "T1",
                            "scientificName": "Quercus alba L.",
                            "scientificNameAuthorship": "L.",
                            "taxonRank": "species",
                            "vernacularName": [{ "vernacularName": "white oak", "language": "en" }]
                        }),
                    ),
                    raw(
                        "T2",
                        json!({ "taxonID": "T2", "scientificName": "Quercus candida", "acceptedNameUsageID": "T1" }),
                    ),
                    raw("T3", json!({ "taxonID": "T3", "taxonRank": "genus" })),
                    raw(
                        "T4",
                        json!({ "taxonID": "T4", "scientificName": "Pinus nova", "acceptedNameUsageID": "T99" }),
                    ),
                ],
            )
            .unwrap();
        store
            .upsert_many(
                "redlist",
                &[Document::from_serializable(
                    "r1",
                    &json!({ "taxonID": "X1", "scientificName": "quercus alba", "category": "VU" }),
                )
                .unwrap()],
            )
            .unwrap();
        let locks = LockManager::new(store.clone(), LockConfig::default());
        Self {
            _tmp: tmp,
            store,
            locks,
            progress: ProgressContext::new(),
        }
    }

    fn config(version: &str) -> TransformConfig {
        TransformConfig {
            version: version.into(),
            batch_size: 2,
            workers: 2,
            enrichment: vec![EnrichmentSource {
                name: "redlist".into(),
                collection: "redlist".into(),
            }],
            ..TransformConfig::default()
        }
    }

    fn transformer<'a>(&'a self, config: &'a TransformConfig) -> Transformer<'a> {
        Transformer::new(self.store.clone(), &self.locks, config, &self.progress)
    }

    fn taxa(&self) -> Vec<(String, Map<String, Value>)> {
        self.store
            .find_all(collections::TAXA)
            .unwrap()
            .into_iter()
            .map(|d| (d.id, d.body))
            .collect()
    }

    fn taxon(&self, local_id: &str) -> Map<String, Value> {
        self.store
            .find_one(collections::TAXA, &record_id("kbif", local_id))
            .unwrap()
            .unwrap()
            .body
    }
}

#[test]
fn normalizes_enriches_and_backfills() {
    let h = Harness::new();
    let config = Harness::config("v1");
    let summary = h.transformer(&config).run().unwrap();
    assert_eq!(summary.processed, 4);
    assert_eq!(summary.inserted, 3);
    assert_eq!(summary.rejected, 1);
    assert!(!summary.interrupted);

    let oak = h.taxon("T1");
    assert_eq!(oak["canonicalName"], "Quercus alba");
    assert_eq!(oak["transformVersion"], "v1");
    assert_eq!(oak["conservation"][0]["category"], "VU");
    assert_eq!(oak["conservation"].as_array().unwrap().len(), 1);
    assert_eq!(oak["vernacularNames"][0]["name"], "white oak");
    assert_eq!(oak["source"]["recordId"], "T1");
    assert_eq!(oak["source"]["rawId"], record_id("kbif", "T1"));

    assert_eq!(h.taxon("T2")["acceptedName"], "Quercus alba L.");
    assert_eq!(h.taxon("T4")["acceptedName"], Value::Null);

    // rejected record is stamped with the step that rejected it
    let t3 = h
        .store
        .find_one(collections::RAW, &record_id("kbif", "T3"))
        .unwrap()
        .unwrap();
    assert_eq!(t3.body["status"]["rejectedBy"], "requireName");
    assert_eq!(t3.body["status"]["isProcessed"], false);
    assert_eq!(t3.body["status"]["transformVersion"], "v1");

    let runs = MetricsSnapshot::recent(h.store.as_ref(), Some("transform"), 5).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
    assert_eq!(runs[0].errors.get(RELATED_NAME_MISSING), Some(&1));
    assert_eq!(runs[0].errors.get("rejected:requireName"), Some(&1));
}

#[test]
fn rerun_with_same_version_is_a_no_op() {
    let h = Harness::new();
    let config = Harness::config("v1");
    h.transformer(&config).run().unwrap();
    let before = h.taxa();

    let summary = h.transformer(&config).run().unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.inserted + summary.updated, 0);
    assert_eq!(h.taxa(), before);

    // a new version reprocesses everything and overwrites in place
    let summary = h.transformer(&Harness::config("v2")).run().unwrap();
    assert_eq!(summary.processed, 4);
    assert_eq!(summary.updated, 3);
    assert_eq!(h.taxa().len(), 3);
    assert_eq!(h.store.count_with_version(collections::TAXA, "v2").unwrap(), 3);
}

#[test]
fn disabled_enrichment_step() {
    let h = Harness::new();
    let config = TransformConfig {
        disabled_steps: vec!["enrich".into(), "noSuchStep".into()],
        ..Harness::config("v1")
    };
    h.transformer(&config).run().unwrap();
    let oak = h.taxon("T1");
    assert_eq!(oak["conservation"], json!([]));
}

#[test]
fn held_lock_fails_and_records_metrics() {
    let h = Harness::new();
    let config = Harness::config("v1");
    let held = h
        .locks
        .acquire(&resource_name("transform", Some("taxa")), false)
        .unwrap();

    let err = h.transformer(&config).run().unwrap_err();
    assert!(err.to_string().contains(&held.holder_id));
    assert!(h.taxa().is_empty());

    let runs = MetricsSnapshot::recent(h.store.as_ref(), Some("transform"), 5).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Failed);
    assert_eq!(runs[0].errors.get("lock"), Some(&1));

    h.locks.release(&held, Ok(())).unwrap();
    assert_eq!(h.transformer(&config).run().unwrap().processed, 4);
}

#[test]
fn reingested_record_is_normalized_again() {
    let h = Harness::new();
    let config = Harness::config("v1");
    h.transformer(&config).run().unwrap();
    assert_eq!(h.taxon("T1")["canonicalName"], "Quercus alba");

    // a new provider version replaces the raw record with a fresh status
    h.store
        .upsert_many(
            collections::RAW,
            &[raw_at(
                "T1",
                "2024-2",
                json!({ "taxonID": "T1", "scientificName": "Quercus rubra L.", "scientificNameAuthorship": "L." }),
            )],
        )
        .unwrap();

    let summary = h.transformer(&config).run().unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.updated, 1);
    let oak = h.taxon("T1");
    assert_eq!(oak["canonicalName"], "Quercus rubra");
    assert_eq!(oak["source"]["providerVersion"], "2024-2");
    assert_eq!(oak["transformVersion"], "v1");
}

#[test]
fn stamped_record_without_output_is_redone() {
    let h = Harness::new();
    let config = Harness::config("v1");
    h.transformer(&config).run().unwrap();
    let removed = h
        .store
        .delete_superseded(collections::TAXA, "kbif", "none")
        .unwrap();
    assert_eq!(removed, 3);

    // rejected T3 stays skipped, the three lost outputs come back
    let summary = h.transformer(&config).run().unwrap();
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.inserted, 3);
    assert_eq!(h.taxa().len(), 3);
}

#[test]
fn oversized_raw_status_is_counted() {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("taxaline.duckdb");
    // distribution rows carry columns the normalized form leaves out
    let rows: Vec<Value> = (0..8)
        .map(|i| json!({ "taxonID": "T5", "countryCode": "ca", "source": format!("{i}{}", "x".repeat(400)) }))
        .collect();
    {
        let store = DuckStore::open(&path, None).unwrap();
        store
            .upsert_many(
                collections::RAW,
                &[raw(
                    "T5",
                    json!({ "taxonID": "T5", "scientificName": "Abies balsamea", "distribution": rows }),
                )],
            )
            .unwrap();
    }
    let store = Arc::new(DuckStore::open(&path, None).unwrap().with_limits(StoreLimits {
        max_document_bytes: 2048,
        ..StoreLimits::default()
    }));
    let locks = LockManager::new(store.clone(), LockConfig::default());
    let progress = ProgressContext::new();
    let config = Harness::config("v1");

    let summary = Transformer::new(store.clone(), &locks, &config, &progress)
        .run()
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.inserted, 1);
    assert_eq!(
        store
            .find_one(collections::TAXA, &record_id("kbif", "T5"))
            .unwrap()
            .unwrap()
            .body["distribution"][0]["countryCode"],
        "CA"
    );

    let runs = MetricsSnapshot::recent(store.as_ref(), Some("transform"), 5).unwrap();
    assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
    assert_eq!(runs[0].errors.get(RAW_STATUS_TOO_LARGE), Some(&1));
    let t5 = store
        .find_one(collections::RAW, &record_id("kbif", "T5"))
        .unwrap()
        .unwrap();
    assert_eq!(t5.body["status"]["transformVersion"], Value::Null);
}
