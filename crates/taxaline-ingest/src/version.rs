//! Remote version checks, fanned out under a concurrency limit

use std::sync::Mutex;

use taxaline_core::{ErrorCategory, Semaphore};
use taxaline_dwca::{parse_eml, DatasetMeta};
use taxaline_store::{collections, DocumentStore};

use crate::config::ProviderConfig;
use crate::raw::ProviderState;
use crate::source::ArchiveSource;

/// What a provider's metadata says about its published archive.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionStatus {
    /// Published version equals the stored one.
    Current { version: String },
    /// New or changed version, or no metadata to compare against.
    Outdated {
        version: Option<String>,
        dataset: DatasetMeta,
    },
    /// Metadata answered 404/410.
    Retired { reason: String },
    /// Transport failure reaching the provider's host.
    Offline { reason: String },
    /// Metadata was unreadable; the archive is still attempted.
    Unknown { reason: String },
}

#[derive(Debug, Clone)]
pub struct VersionCheck {
    pub provider_id: String,
    pub stored_version: Option<String>,
    pub status: VersionStatus,
}

impl VersionCheck {
    pub fn needs_ingest(&self, force: bool) -> bool {
        match &self.status {
            VersionStatus::Current { .. } => force,
            VersionStatus::Outdated { .. } | VersionStatus::Unknown { .. } => true,
            VersionStatus::Retired { .. } | VersionStatus::Offline { .. } => false,
        }
    }

    /// Version to ingest under, when the metadata told us.
    pub fn remote_version(&self) -> Option<&str> {
        match &self.status {
            VersionStatus::Current { version } => Some(version),
            VersionStatus::Outdated { version, .. } => version.as_deref(),
            _ => None,
        }
    }
}

pub fn stored_state(
    store: &dyn DocumentStore,
    provider_id: &str,
) -> anyhow::Result<Option<ProviderState>> {
    match store.find_one(collections::PROVIDERS, provider_id)? {
        Some(doc) => Ok(Some(doc.decode()?)),
        None => Ok(None),
    }
}

fn check_one(
    provider: &ProviderConfig,
    stored_version: Option<&str>,
    source: &dyn ArchiveSource,
) -> VersionStatus {
    let Some(url) = &provider.metadata_url else {
        return VersionStatus::Outdated {
            version: None,
            dataset: DatasetMeta::default(),
        };
    };
    let xml = match source.fetch_metadata(url) {
        Ok(xml) => xml,
        Err(e) => {
            let reason = e.to_string();
            return match e.category() {
                ErrorCategory::NotFound => VersionStatus::Retired { reason },
                ErrorCategory::Transport => VersionStatus::Offline { reason },
                _ => VersionStatus::Unknown { reason },
            };
        }
    };
    match parse_eml(&xml) {
        Ok(dataset) => match dataset.version.clone() {
            Some(v) if stored_version == Some(v.as_str()) => VersionStatus::Current { version: v },
            version => VersionStatus::Outdated { version, dataset },
        },
        Err(e) => VersionStatus::Unknown {
            reason: e.to_string(),
        },
    }
}

/// Check every provider's published version, at most `concurrency` requests at a time.
///
/// Results come back in provider order.
pub fn check_versions(
    providers: &[ProviderConfig],
    store: &dyn DocumentStore,
    source: &dyn ArchiveSource,
    concurrency: usize,
) -> anyhow::Result<Vec<VersionCheck>> {
    let mut stored = Vec::with_capacity(providers.len());
    for p in providers {
        stored.push(stored_state(store, &p.id)?.map(|s| s.version));
    }

    let semaphore = Semaphore::new(concurrency);
    let results: Vec<Mutex<Option<VersionStatus>>> =
        providers.iter().map(|_| Mutex::new(None)).collect();

    rayon::scope(|s| {
        for (i, provider) in providers.iter().enumerate() {
            let semaphore = &semaphore;
            let results = &results;
            let stored = &stored;
            s.spawn(move |_| {
                let _permit = semaphore.acquire();
                let status = check_one(provider, stored[i].as_deref(), source);
                log::debug!("{}: version check {status:?}", provider.id);
                *results[i].lock().unwrap_or_else(|e| e.into_inner()) = Some(status);
            });
        }
    });

    Ok(providers
        .iter()
        .zip(stored)
        .zip(results)
        .map(|((p, stored_version), slot)| VersionCheck {
            provider_id: p.id.clone(),
            stored_version,
            status: slot
                .into_inner()
                .unwrap_or_else(|e| e.into_inner())
                .unwrap_or(VersionStatus::Unknown {
                    reason: "version check did not run".into(),
                }),
        })
        .collect())
}
