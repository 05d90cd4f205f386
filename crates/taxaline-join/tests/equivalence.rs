use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use taxaline_dwca::{join_archive, JoinedRecord, Manifest};
use taxaline_join::{BatchedJoin, JoinConfig};
use tempfile::TempDir;

const META: &str = r#"<archive xmlns="http://rs.tdwg.org/dwc/text/">
  <core rowType="http://rs.tdwg.org/dwc/terms/Taxon">
    <files><location>taxon.txt</location></files>
    <id index="0"/>
    <field index="0" term="http://rs.tdwg.org/dwc/terms/taxonID"/>
    <field index="1" term="http://rs.tdwg.org/dwc/terms/scientificName"/>
    <field index="2" term="http://rs.tdwg.org/dwc/terms/taxonRemarks"/>
  </core>
  <extension rowType="http://rs.gbif.org/terms/1.0/VernacularName">
    <files><location>vernacular.txt</location></files>
    <coreid index="0"/>
    <field index="1" term="http://rs.tdwg.org/dwc/terms/vernacularName"/>
  </extension>
  <extension rowType="http://rs.gbif.org/terms/1.0/Distribution">
    <files><location>distribution.txt</location></files>
    <coreid index="0"/>
    <field index="1" term="http://rs.tdwg.org/dwc/terms/locality"/>
  </extension>
</archive>"#;

/// Archive with duplicates, orphans, blank rows, JSON cells, and ids that
/// sort differently from file order.
fn build_archive(dir: &Path, n: usize) {
    let mut core = String::from("taxonID\tscientificName\ttaxonRemarks\n");
    let mut vern = String::from("id\tname\n");
    let mut dist = String::from("id\tlocality\n");
    for i in (0..n).rev() {
        let _ = writeln!(core, "T{i}\tSpecies {i}\t{{\"note\":{i}}}");
        if i % 3 != 0 {
            let _ = writeln!(vern, "T{i}\tfirst {i}");
            let _ = writeln!(vern, "T{i}\t");
            let _ = writeln!(vern, "T{i}\tsecond {i}");
        }
        if i % 4 == 0 {
            let _ = writeln!(dist, "T{i}\t{{\"country\":\"KR\"}}");
        }
    }
    let _ = writeln!(core, "T1\tDuplicate of T1\t");
    let _ = writeln!(vern, "NOPE\torphan");
    // no trailing newline on the last distribution row
    dist.push_str("T2\tlast line");

    fs::write(dir.join("meta.xml"), META).unwrap();
    fs::write(dir.join("taxon.txt"), core).unwrap();
    fs::write(dir.join("vernacular.txt"), vern).unwrap();
    fs::write(dir.join("distribution.txt"), dist).unwrap();
}

fn streaming(dir: &Path) -> Vec<JoinedRecord> {
    let manifest = Manifest::read_from(dir).unwrap();
    let mut records = join_archive(dir, &manifest).unwrap().into_records();
    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}

fn batched(dir: &Path, work: &Path, batch_size: usize) -> (BatchedJoin, Vec<JoinedRecord>) {
    let manifest = Manifest::read_from(dir).unwrap();
    let config = JoinConfig {
        work_dir: work.to_path_buf(),
        batch_size,
        memory_limit: None,
    };
    let engine = BatchedJoin::load(dir, &manifest, &config).unwrap();
    let mut out = Vec::new();
    for batch in engine.batches() {
        let batch = batch.unwrap();
        assert!(batch.len() <= batch_size);
        out.extend(batch);
    }
    (engine, out)
}

#[test]
fn batched_matches_streaming() {
    let _ = env_logger::builder().is_test(true).try_init();
    let data = TempDir::new().unwrap();
    build_archive(data.path(), 40);
    let expected = streaming(data.path());
    assert_eq!(expected.len(), 40);

    for batch_size in [1, 7, 1000] {
        let work = TempDir::new().unwrap();
        let (_, got) = batched(data.path(), work.path(), batch_size);
        assert_eq!(got, expected, "batch_size = {batch_size}");
    }
}

#[test]
fn stats_match_streaming() {
    let data = TempDir::new().unwrap();
    build_archive(data.path(), 12);
    let manifest = Manifest::read_from(data.path()).unwrap();
    let stream_stats = join_archive(data.path(), &manifest).unwrap().stats;

    let work = TempDir::new().unwrap();
    let (engine, _) = batched(data.path(), work.path(), 5);
    assert_eq!(engine.stats(), &stream_stats);
    assert_eq!(stream_stats.duplicate_ids, 1);
    assert_eq!(stream_stats.orphan_extension_rows, 1);
}

#[test]
fn ascending_and_restartable() {
    let data = TempDir::new().unwrap();
    build_archive(data.path(), 25);
    let work = TempDir::new().unwrap();
    let (engine, first) = batched(data.path(), work.path(), 4);

    let ids: Vec<_> = first.iter().map(|r| r.id.clone()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let again: Vec<_> = engine
        .batches()
        .flat_map(|b| b.unwrap())
        .collect();
    assert_eq!(again, first);
}

#[test]
fn empty_core_yields_no_batches() {
    let data = TempDir::new().unwrap();
    fs::write(data.path().join("meta.xml"), META).unwrap();
    for f in ["taxon.txt", "vernacular.txt", "distribution.txt"] {
        fs::write(data.path().join(f), "header\n").unwrap();
    }
    let work = TempDir::new().unwrap();
    let (engine, got) = batched(data.path(), work.path(), 10);
    assert!(got.is_empty());
    assert_eq!(engine.core_count().unwrap(), 0);
}
