use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use indicatif::ProgressBar;
use serde_json::Value;
use taxaline_core::{ProgressContext, StreamError};
use taxaline_dwca::DwcaError;
use taxaline_ingest::{
    ArchiveSource, IngestConfig, IngestSummary, Ingestor, JoinMode, ProviderConfig,
    ProviderOutcome,
};
use taxaline_store::{
    collections, resource_name, DocumentStore, LockConfig, LockManager, MemoryStore,
    MetricsSnapshot, RunOutcome,
};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

const META: &str = r#"<archive xmlns="http://rs.tdwg.org/dwc/text/">
  <core rowType="http://rs.tdwg.org/dwc/terms/Taxon">
    <files><location>taxon.txt</location></files>
    <id index="0"/>
    <field index="1" term="http://rs.tdwg.org/dwc/terms/scientificName"/>
    <field index="2" term="http://rs.tdwg.org/dwc/terms/taxonRank"/>
  </core>
  <extension rowType="http://rs.gbif.org/terms/1.0/VernacularName">
    <files><location>vernacular.txt</location></files>
    <coreid index="0"/>
    <field index="1" term="http://rs.tdwg.org/dwc/terms/vernacularName"/>
  </extension>
</archive>"#;

fn eml(version: &str) -> String {
    format!(
        r#"<eml:eml xmlns:eml="eml://ecoinformatics.org/eml-2.1.1" packageId="flora/{version}">
  <dataset><title>Flora</title></dataset>
</eml:eml>"#
    )
}

fn archive_zip(taxa: &str, vernacular: &str) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default();
    for (name, body) in [
        ("meta.xml", META),
        ("taxon.txt", taxa),
        ("vernacular.txt", vernacular),
    ] {
        zip.start_file(name, opts).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn v1_archive() -> Vec<u8> {
    archive_zip(
        "id\tname\trank\nT1\tQuercus alba\tspecies\nT2\tQuercus rubra\tspecies\nT3\tPinus\tgenus\n",
        "id\tname\nT1\twhite oak\nT2\tred oak\nT9\torphan\n",
    )
}

enum Served {
    Body(Vec<u8>),
    Status(u16),
    Unreachable,
}

/// Serves canned metadata and archives by URL.
#[derive(Default)]
struct LocalSource {
    metadata: Mutex<BTreeMap<String, String>>,
    archives: Mutex<BTreeMap<String, Served>>,
    downloads: AtomicUsize,
}

impl LocalSource {
    fn set_metadata(&self, url: &str, xml: String) {
        self.metadata.lock().unwrap().insert(url.into(), xml);
    }

    fn set_archive(&self, url: &str, served: Served) {
        self.archives.lock().unwrap().insert(url.into(), served);
    }
}

fn error_for(served: &Served) -> Option<StreamError> {
    match served {
        Served::Body(_) => None,
        Served::Status(s) => Some(StreamError::Http {
            status: Some(*s),
            message: format!("HTTP {s}"),
        }),
        Served::Unreachable => Some(StreamError::Http {
            status: None,
            message: "connection refused".into(),
        }),
    }
}

impl ArchiveSource for LocalSource {
    fn fetch_metadata(&self, url: &str) -> Result<String, StreamError> {
        self.metadata
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(StreamError::Http {
                status: Some(404),
                message: "no metadata".into(),
            })
    }

    fn download(&self, url: &str, dest: &Path, _pb: &ProgressBar) -> Result<u64, DwcaError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let archives = self.archives.lock().unwrap();
        let served = archives.get(url).unwrap_or(&Served::Status(404));
        if let Some(e) = error_for(served) {
            return Err(e.into());
        }
        let Served::Body(bytes) = served else {
            unreachable!()
        };
        fs::write(dest, bytes).unwrap();
        Ok(bytes.len() as u64)
    }
}

struct Harness {
    _tmp: TempDir,
    store: Arc<MemoryStore>,
    locks: LockManager,
    config: IngestConfig,
    progress: ProgressContext,
}

impl Harness {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone(), LockConfig::default());
        let config = IngestConfig {
            work_dir: tmp.path().join("work"),
            workers: 2,
            ..IngestConfig::default()
        };
        Self {
            _tmp: tmp,
            store,
            locks,
            config,
            progress: ProgressContext::new(),
        }
    }

    fn run(&self, source: &LocalSource, providers: &[ProviderConfig]) -> IngestSummary {
        Ingestor::new(
            self.store.clone(),
            &self.locks,
            source,
            &self.config,
            &self.progress,
        )
        .run(providers)
        .unwrap()
    }

    /// scientificName by local id, from the raw collection.
    fn raw_names(&self) -> BTreeMap<String, Value> {
        self.store
            .find_all(collections::RAW)
            .unwrap()
            .into_iter()
            .map(|d| {
                let local = d.get_str("localId").unwrap().to_string();
                (local, d.body["record"].clone())
            })
            .collect()
    }
}

fn flora() -> ProviderConfig {
    ProviderConfig::new("flora", "http://flora.example/dwca.zip")
        .with_metadata("http://flora.example/eml.xml")
}

#[test]
fn new_version_supersedes_old_records() {
    let h = Harness::new();
    let source = LocalSource::default();
    source.set_metadata("http://flora.example/eml.xml", eml("1"));
    source.set_archive("http://flora.example/dwca.zip", Served::Body(v1_archive()));

    let summary = h.run(&source, &[flora()]);
    match &summary.reports[0].outcome {
        ProviderOutcome::Ingested {
            version,
            records,
            superseded,
            mode,
        } => {
            assert_eq!(version, "1");
            assert_eq!(*records, 3);
            assert_eq!(*superseded, 0);
            assert_eq!(*mode, JoinMode::Streaming);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let raw = h.raw_names();
    assert_eq!(raw.len(), 3);
    assert_eq!(raw["T1"]["vernacularName"][0]["vernacularName"], "white oak");

    let state = h.store.find_one(collections::PROVIDERS, "flora").unwrap().unwrap();
    assert_eq!(state.get_str("version"), Some("1"));

    // unchanged version: nothing downloaded
    let summary = h.run(&source, &[flora()]);
    assert!(matches!(
        summary.reports[0].outcome,
        ProviderOutcome::UpToDate { .. }
    ));
    assert_eq!(source.downloads.load(Ordering::SeqCst), 1);

    source.set_metadata("http://flora.example/eml.xml", eml("2"));
    source.set_archive(
        "http://flora.example/dwca.zip",
        Served::Body(archive_zip(
            "id\tname\trank\nT1\tQuercus alba L.\tspecies\nT4\tAcer\tgenus\n",
            "id\tname\n",
        )),
    );
    let summary = h.run(&source, &[flora()]);
    assert!(matches!(
        summary.reports[0].outcome,
        ProviderOutcome::Ingested { superseded: 2, .. }
    ));
    let raw = h.raw_names();
    assert_eq!(raw.keys().collect::<Vec<_>>(), ["T1", "T4"]);
    assert_eq!(raw["T1"]["scientificName"], "Quercus alba L.");
    assert_eq!(
        h.store.ids_with_version(collections::RAW, "2").unwrap().len(),
        2
    );
}

#[test]
fn retired_archive_is_a_clean_skip() {
    let h = Harness::new();
    let source = LocalSource::default();
    source.set_archive("http://gone.example/dwca.zip", Served::Status(404));

    let provider = ProviderConfig::new("gone", "http://gone.example/dwca.zip");
    let summary = h.run(&source, &[provider]);
    assert!(matches!(
        summary.reports[0].outcome,
        ProviderOutcome::Retired { .. }
    ));
    assert_eq!(summary.failed(), 0);
    assert_eq!(h.store.count(collections::RAW).unwrap(), 0);

    let runs = MetricsSnapshot::recent(h.store.as_ref(), Some("ingest"), 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
    assert_eq!(runs[0].errors.get("notFound"), Some(&1));
    // the lock was released as completed
    let lock = h.locks.get(&resource_name("ingest", Some("gone"))).unwrap().unwrap();
    assert_eq!(lock.state.to_string(), "completed");
}

#[test]
fn offline_host_skips_its_other_providers() {
    let mut h = Harness::new();
    h.config.workers = 1;
    let source = LocalSource::default();
    source.set_archive("http://down.example/a.zip", Served::Unreachable);
    source.set_archive("http://down.example/b.zip", Served::Body(v1_archive()));

    let providers = [
        ProviderConfig::new("a", "http://down.example/a.zip"),
        ProviderConfig::new("b", "http://down.example/b.zip"),
    ];
    let summary = h.run(&source, &providers);
    for report in &summary.reports {
        assert!(
            matches!(&report.outcome, ProviderOutcome::Offline { host, .. } if host == "down.example"),
            "{}: {:?}",
            report.provider_id,
            report.outcome
        );
    }
    assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(summary.failed(), 0);
}

#[test]
fn batched_join_writes_the_same_records() {
    let source = LocalSource::default();
    source.set_metadata("http://flora.example/eml.xml", eml("1"));
    source.set_archive("http://flora.example/dwca.zip", Served::Body(v1_archive()));

    let streaming = Harness::new();
    streaming.run(&source, &[flora()]);

    let mut batched = Harness::new();
    batched.config.force_batched = true;
    batched.config.join_batch_size = 2;
    let summary = batched.run(&source, &[flora()]);
    assert!(matches!(
        summary.reports[0].outcome,
        ProviderOutcome::Ingested {
            mode: JoinMode::Batched,
            records: 3,
            ..
        }
    ));

    assert_eq!(streaming.raw_names(), batched.raw_names());
}

#[test]
fn metrics_record_join_anomalies() {
    let h = Harness::new();
    let source = LocalSource::default();
    source.set_metadata("http://flora.example/eml.xml", eml("7"));
    source.set_archive("http://flora.example/dwca.zip", Served::Body(v1_archive()));

    h.run(&source, &[flora()]);
    let runs = MetricsSnapshot::recent(h.store.as_ref(), Some("ingest"), 10).unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.runner, "flora");
    assert_eq!(run.version.as_deref(), Some("7"));
    assert_eq!(run.outcome, RunOutcome::Succeeded);
    assert_eq!(run.processed, 3);
    assert_eq!(run.inserted, 3);
    assert_eq!(run.errors.get("orphanExtensionRow"), Some(&1));
}

#[test]
fn held_lock_fails_the_provider() {
    let h = Harness::new();
    let source = LocalSource::default();
    source.set_archive("http://flora.example/dwca.zip", Served::Body(v1_archive()));
    let provider = ProviderConfig::new("flora", "http://flora.example/dwca.zip");

    let held = h
        .locks
        .acquire(&resource_name("ingest", Some("flora")), false)
        .unwrap();
    let summary = h.run(&source, &[provider]);
    match &summary.reports[0].outcome {
        ProviderOutcome::Locked { holder } => assert_eq!(holder, &held.holder_id),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(summary.failed(), 1);
    assert_eq!(source.downloads.load(Ordering::SeqCst), 0);

    let runs = MetricsSnapshot::recent(h.store.as_ref(), Some("ingest"), 10).unwrap();
    assert_eq!(runs[0].outcome, RunOutcome::Failed);
}

#[test]
fn refused_archive_fails_only_its_provider() {
    let mut h = Harness::new();
    h.config.workers = 1;
    let source = LocalSource::default();
    source.set_archive("http://ipt.example/a.zip", Served::Status(403));
    source.set_archive("http://ipt.example/b.zip", Served::Body(v1_archive()));

    let providers = [
        ProviderConfig::new("a", "http://ipt.example/a.zip"),
        ProviderConfig::new("b", "http://ipt.example/b.zip"),
    ];
    let summary = h.run(&source, &providers);
    assert!(
        matches!(summary.reports[0].outcome, ProviderOutcome::Failed { .. }),
        "{:?}",
        summary.reports[0].outcome
    );
    // the host stays online for its other providers
    assert!(matches!(
        summary.reports[1].outcome,
        ProviderOutcome::Ingested { records: 3, .. }
    ));
    assert_eq!(summary.failed(), 1);
    assert_eq!(source.downloads.load(Ordering::SeqCst), 2);

    let runs = MetricsSnapshot::recent(h.store.as_ref(), Some("ingest"), 10).unwrap();
    let refused = runs.iter().find(|r| r.runner == "a").unwrap();
    assert_eq!(refused.outcome, RunOutcome::Failed);
    assert_eq!(refused.errors.get("refused"), Some(&1));
}
