//! In-process document store, for tests and dry runs

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::document::{Document, StoreError, StoreLimits, WriteSummary};
use crate::store::{validate_collection, ConditionalWrite, DocumentStore, WriteGuard};

type Collections = FxHashMap<String, BTreeMap<String, Document>>;

/// [`DocumentStore`] backed by ordered in-memory maps.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
    limits: StoreLimits,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: StoreLimits) -> Self {
        Self {
            collections: RwLock::default(),
            limits,
        }
    }

    fn read<T>(
        &self,
        collection: &str,
        f: impl FnOnce(Option<&BTreeMap<String, Document>>) -> T,
    ) -> Result<T, StoreError> {
        validate_collection(collection)?;
        let guard = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(f(guard.get(collection)))
    }

    fn write<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut BTreeMap<String, Document>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        validate_collection(collection)?;
        let mut guard = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(guard.entry(collection.to_string()).or_default())
    }
}

impl DocumentStore for MemoryStore {
    fn limits(&self) -> StoreLimits {
        self.limits
    }

    fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.read(collection, |c| c.and_then(|c| c.get(id).cloned()))
    }

    fn find_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.read(collection, |c| {
            c.map(|c| c.values().cloned().collect()).unwrap_or_default()
        })
    }

    fn scan_after(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.read(collection, |c| {
            let Some(c) = c else { return Vec::new() };
            let iter: Box<dyn Iterator<Item = &Document>> = match after {
                Some(after) => Box::new(
                    c.range::<str, _>((Bound::Excluded(after), Bound::Unbounded))
                        .map(|(_, d)| d),
                ),
                None => Box::new(c.values()),
            };
            iter.take(limit).cloned().collect()
        })
    }

    fn ids_with_version(
        &self,
        collection: &str,
        version: &str,
    ) -> Result<FxHashSet<String>, StoreError> {
        self.read(collection, |c| {
            c.map(|c| {
                c.values()
                    .filter(|d| d.version.as_deref() == Some(version))
                    .map(|d| d.id.clone())
                    .collect()
            })
            .unwrap_or_default()
        })
    }

    fn count_with_version(&self, collection: &str, version: &str) -> Result<u64, StoreError> {
        self.read(collection, |c| {
            c.map_or(0, |c| {
                c.values()
                    .filter(|d| d.version.as_deref() == Some(version))
                    .count() as u64
            })
        })
    }

    fn count(&self, collection: &str) -> Result<u64, StoreError> {
        self.read(collection, |c| c.map_or(0, |c| c.len() as u64))
    }

    fn upsert_many(
        &self,
        collection: &str,
        docs: &[Document],
    ) -> Result<WriteSummary, StoreError> {
        self.limits.check_batch(docs)?;
        self.write(collection, |c| {
            let mut summary = WriteSummary::default();
            for doc in docs {
                match c.insert(doc.id.clone(), doc.clone()) {
                    Some(_) => summary.updated += 1,
                    None => summary.inserted += 1,
                }
            }
            Ok(summary)
        })
    }

    fn insert_one(&self, collection: &str, doc: &Document) -> Result<(), StoreError> {
        self.limits.check_batch(std::slice::from_ref(doc))?;
        self.write(collection, |c| {
            if c.contains_key(&doc.id) {
                return Err(StoreError::Backend(format!(
                    "duplicate id '{}' in {collection}",
                    doc.id
                )));
            }
            c.insert(doc.id.clone(), doc.clone());
            Ok(())
        })
    }

    fn replace_if(
        &self,
        collection: &str,
        guard: &WriteGuard<'_>,
        doc: &Document,
    ) -> Result<ConditionalWrite, StoreError> {
        self.limits.check_batch(std::slice::from_ref(doc))?;
        self.write(collection, |c| {
            let current = c.get(&doc.id);
            if guard(current) {
                c.insert(doc.id.clone(), doc.clone());
                Ok(ConditionalWrite::Written)
            } else {
                Ok(ConditionalWrite::Rejected(current.cloned()))
            }
        })
    }

    fn delete_superseded(
        &self,
        collection: &str,
        partition: &str,
        keep_version: &str,
    ) -> Result<u64, StoreError> {
        self.write(collection, |c| {
            let before = c.len();
            c.retain(|_, d| {
                d.partition.as_deref() != Some(partition)
                    || d.version.as_deref() == Some(keep_version)
            });
            Ok((before - c.len()) as u64)
        })
    }
}
