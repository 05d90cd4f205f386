//! Cross-process locks held as documents in the store
//!
//! A lock is one document per resource (`ingest:{provider}`,
//! `transform:{pipeline}`). Acquisition is a conditional write: it succeeds
//! when no lock exists, when the existing lock is not running, when it has
//! expired (no heartbeat within the TTL), or when the caller forces it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taxaline_core::ErrorCategory;
use uuid::Uuid;

use crate::document::{Document, StoreError};
use crate::store::{collections, ConditionalWrite, DocumentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Persisted lock document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub resource: String,
    pub holder_id: String,
    pub state: LockState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set when this holder took the lock over a live one, or an operator
    /// force-released it. Cleared on clean completion.
    #[serde(default)]
    pub forced: bool,
}

impl LockRecord {
    /// Running and not yet past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.state == LockState::Running && now <= self.expires_at
    }
}

/// Proof of a successful acquisition. Required to release or heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub resource: String,
    pub holder_id: String,
}

#[derive(Debug)]
pub enum LockError {
    /// Another live holder owns the resource.
    Held {
        resource: String,
        current: Box<LockRecord>,
    },
    /// The lock was taken over (or force-released) since we acquired it.
    NotHolder {
        resource: String,
        holder_id: String,
    },
    Store(StoreError),
}

impl LockError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Held { .. } | Self::NotHolder { .. } => ErrorCategory::Lock,
            Self::Store(e) => e.category(),
        }
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Held { resource, current } => write!(
                f,
                "lock '{resource}' is held by {} since {} (expires {})",
                current.holder_id,
                current.started_at.to_rfc3339(),
                current.expires_at.to_rfc3339(),
            ),
            Self::NotHolder {
                resource,
                holder_id,
            } => write!(f, "lock '{resource}' is no longer held by {holder_id}"),
            Self::Store(e) => write!(f, "lock store: {e}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for LockError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Lock resource name for a pipeline stage, optionally scoped to one provider.
pub fn resource_name(stage: &str, scope: Option<&str>) -> String {
    match scope {
        Some(scope) => format!("{stage}:{scope}"),
        None => stage.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// How long a lock stays live without a heartbeat.
    pub ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Acquires and releases locks against an injected store.
pub struct LockManager {
    store: Arc<dyn DocumentStore>,
    ttl: chrono::Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn DocumentStore>, config: LockConfig) -> Self {
        let ttl = chrono::Duration::from_std(config.ttl).unwrap_or(chrono::Duration::MAX);
        Self { store, ttl }
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn get(&self, resource: &str) -> Result<Option<LockRecord>, LockError> {
        match self.store.find_one(collections::LOCKS, resource)? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<LockRecord>, LockError> {
        let docs = self.store.find_all(collections::LOCKS)?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            match doc.decode::<LockRecord>() {
                Ok(rec) => out.push(rec),
                Err(e) => log::warn!("Skipping unreadable lock document {}: {e}", doc.id),
            }
        }
        Ok(out)
    }

    /// Try to take the lock for `resource`.
    pub fn acquire(&self, resource: &str, force: bool) -> Result<LockHandle, LockError> {
        let now = Utc::now();
        let record = LockRecord {
            resource: resource.to_string(),
            holder_id: Uuid::new_v4().to_string(),
            state: LockState::Running,
            started_at: now,
            updated_at: now,
            ended_at: None,
            expires_at: self.expiry(now),
            error: None,
            forced: force,
        };
        let doc = Document::from_serializable(resource, &record)?;

        let guard = |current: Option<&Document>| {
            if force {
                return true;
            }
            match current.map(Document::decode::<LockRecord>) {
                None => true,
                // unreadable lock documents never block
                Some(Err(_)) => true,
                Some(Ok(rec)) => !rec.is_live(now),
            }
        };

        match self.store.replace_if(collections::LOCKS, &guard, &doc)? {
            ConditionalWrite::Written => {
                if force {
                    log::warn!("Lock '{resource}' acquired with force");
                } else {
                    log::debug!("Lock '{resource}' acquired by {}", record.holder_id);
                }
                Ok(LockHandle {
                    resource: resource.to_string(),
                    holder_id: record.holder_id,
                })
            }
            ConditionalWrite::Rejected(current) => {
                let current = current
                    .map(|d| d.decode::<LockRecord>())
                    .transpose()?
                    .unwrap_or(record);
                Err(LockError::Held {
                    resource: resource.to_string(),
                    current: Box::new(current),
                })
            }
        }
    }

    /// Rewrite the holder's own lock document.
    fn update_own<F>(&self, handle: &LockHandle, f: F) -> Result<LockRecord, LockError>
    where
        F: FnOnce(&mut LockRecord),
    {
        let mut record = self.get(&handle.resource)?.ok_or_else(|| LockError::NotHolder {
            resource: handle.resource.clone(),
            holder_id: handle.holder_id.clone(),
        })?;
        if record.holder_id != handle.holder_id {
            return Err(LockError::NotHolder {
                resource: handle.resource.clone(),
                holder_id: handle.holder_id.clone(),
            });
        }
        f(&mut record);
        let doc = Document::from_serializable(&handle.resource, &record)?;
        let holder = handle.holder_id.as_str();
        let guard = |current: Option<&Document>| {
            current.and_then(|d| d.get_str("holderId")) == Some(holder)
        };
        match self.store.replace_if(collections::LOCKS, &guard, &doc)? {
            ConditionalWrite::Written => Ok(record),
            ConditionalWrite::Rejected(_) => Err(LockError::NotHolder {
                resource: handle.resource.clone(),
                holder_id: handle.holder_id.clone(),
            }),
        }
    }

    /// Extend the expiry of a held lock.
    pub fn heartbeat(&self, handle: &LockHandle) -> Result<(), LockError> {
        let now = Utc::now();
        let expires_at = self.expiry(now);
        self.update_own(handle, |rec| {
            rec.updated_at = now;
            rec.expires_at = expires_at;
        })?;
        Ok(())
    }

    /// Mark the lock completed, or failed with the error text.
    pub fn release(&self, handle: &LockHandle, outcome: Result<(), &str>) -> Result<(), LockError> {
        let now = Utc::now();
        let record = self.update_own(handle, |rec| {
            rec.updated_at = now;
            rec.ended_at = Some(now);
            match outcome {
                Ok(()) => {
                    rec.state = LockState::Completed;
                    rec.error = None;
                    rec.forced = false;
                }
                Err(msg) => {
                    rec.state = LockState::Failed;
                    rec.error = Some(msg.to_string());
                }
            }
        })?;
        log::debug!("Lock '{}' released ({})", handle.resource, record.state);
        Ok(())
    }

    /// Operator override: mark the lock failed regardless of who holds it.
    ///
    /// Returns the record as it was before the override, if any.
    pub fn force_release(
        &self,
        resource: &str,
        reason: &str,
    ) -> Result<Option<LockRecord>, LockError> {
        let previous = self.get(resource)?;
        let now = Utc::now();
        let record = LockRecord {
            resource: resource.to_string(),
            holder_id: Uuid::new_v4().to_string(),
            state: LockState::Failed,
            started_at: previous.as_ref().map_or(now, |p| p.started_at),
            updated_at: now,
            ended_at: Some(now),
            expires_at: now,
            error: Some(reason.to_string()),
            forced: true,
        };
        let doc = Document::from_serializable(resource, &record)?;
        self.store.replace_if(collections::LOCKS, &|_| true, &doc)?;
        log::warn!("Lock '{resource}' force-released: {reason}");
        Ok(previous)
    }

    /// Run `f` while holding `resource`.
    ///
    /// The lock is released as completed or failed depending on `f`'s
    /// result; a failed release is logged and never masks `f`'s own result.
    pub fn with_lock<T, F>(&self, resource: &str, force: bool, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&LockHandle) -> anyhow::Result<T>,
    {
        let handle = self.acquire(resource, force)?;
        let result = f(&handle);
        let outcome = match &result {
            Ok(_) => self.release(&handle, Ok(())),
            Err(e) => self.release(&handle, Err(&format!("{e:#}"))),
        };
        if let Err(e) = outcome {
            log::warn!("Failed to release lock '{resource}': {e}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn manager(ttl: Duration) -> LockManager {
        LockManager::new(Arc::new(MemoryStore::new()), LockConfig { ttl })
    }

    #[test]
    fn acquire_then_held() {
        let locks = manager(Duration::from_secs(60));
        let h = locks.acquire("ingest:p1", false).unwrap();
        match locks.acquire("ingest:p1", false) {
            Err(LockError::Held { current, .. }) => assert_eq!(current.holder_id, h.holder_id),
            other => panic!("expected Held, got {other:?}"),
        }
        // other resources are independent
        locks.acquire("ingest:p2", false).unwrap();
    }

    #[test]
    fn release_allows_reacquire() {
        let locks = manager(Duration::from_secs(60));
        let h = locks.acquire("transform:taxa", false).unwrap();
        locks.release(&h, Ok(())).unwrap();
        let rec = locks.get("transform:taxa").unwrap().unwrap();
        assert_eq!(rec.state, LockState::Completed);
        assert!(rec.ended_at.is_some());
        locks.acquire("transform:taxa", false).unwrap();
    }

    #[test]
    fn failed_release_records_error() {
        let locks = manager(Duration::from_secs(60));
        let h = locks.acquire("r", false).unwrap();
        locks.release(&h, Err("boom")).unwrap();
        let rec = locks.get("r").unwrap().unwrap();
        assert_eq!(rec.state, LockState::Failed);
        assert_eq!(rec.error.as_deref(), Some("boom"));
    }

    #[test]
    fn expired_lock_reclaimed() {
        let locks = manager(Duration::ZERO);
        let first = locks.acquire("r", false).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let second = locks.acquire("r", false).unwrap();
        assert_ne!(first.holder_id, second.holder_id);
        // the stale holder can no longer release
        assert!(matches!(
            locks.release(&first, Ok(())),
            Err(LockError::NotHolder { .. })
        ));
    }

    #[test]
    fn force_acquire_overrides_live_lock() {
        let locks = manager(Duration::from_secs(60));
        locks.acquire("r", false).unwrap();
        let h = locks.acquire("r", true).unwrap();
        assert!(locks.get("r").unwrap().unwrap().forced);
        locks.release(&h, Ok(())).unwrap();
        assert!(!locks.get("r").unwrap().unwrap().forced);
    }

    #[test]
    fn force_release_marks_failed() {
        let locks = manager(Duration::from_secs(60));
        let h = locks.acquire("r", false).unwrap();
        let prev = locks.force_release("r", "operator").unwrap().unwrap();
        assert_eq!(prev.holder_id, h.holder_id);
        let rec = locks.get("r").unwrap().unwrap();
        assert_eq!(rec.state, LockState::Failed);
        assert_ne!(rec.holder_id, h.holder_id);
        assert_eq!(rec.error.as_deref(), Some("operator"));
        locks.acquire("r", false).unwrap();
    }

    #[test]
    fn heartbeat_extends_expiry() {
        let locks = manager(Duration::from_secs(60));
        let h = locks.acquire("r", false).unwrap();
        let before = locks.get("r").unwrap().unwrap().expires_at;
        std::thread::sleep(Duration::from_millis(5));
        locks.heartbeat(&h).unwrap();
        assert!(locks.get("r").unwrap().unwrap().expires_at > before);
    }

    #[test]
    fn with_lock_releases_on_error() {
        let locks = manager(Duration::from_secs(60));
        let err = locks
            .with_lock("r", false, |_| -> anyhow::Result<()> { anyhow::bail!("step broke") })
            .unwrap_err();
        assert!(err.to_string().contains("step broke"));
        let rec = locks.get("r").unwrap().unwrap();
        assert_eq!(rec.state, LockState::Failed);
        assert!(rec.error.unwrap().contains("step broke"));
        assert_eq!(locks.with_lock("r", false, |_| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn resource_names() {
        assert_eq!(resource_name("ingest", Some("p1")), "ingest:p1");
        assert_eq!(resource_name("transform", None), "transform");
    }
}
