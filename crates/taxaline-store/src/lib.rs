//! taxaline-store: Document persistence for the ingestion pipeline
//!
//! A small keyed-document contract ([`DocumentStore`]) with a DuckDB
//! backend for real runs and an in-memory one for tests, plus the pieces
//! built on top of it: process locks, limit-aware bulk writes, and
//! append-only run metrics.

pub mod bulk;
pub mod document;
pub mod duck;
pub mod hash;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod store;

pub use bulk::{write_with_halving, BulkConfig, BulkStats, BulkWriter};
pub use document::{Document, StoreError, StoreLimits, WriteSummary};
pub use duck::DuckStore;
pub use hash::record_id;
pub use lock::{
    resource_name, LockConfig, LockError, LockHandle, LockManager, LockRecord, LockState,
};
pub use memory::MemoryStore;
pub use metrics::{MetricsSnapshot, RunLabel, RunMetrics, RunOutcome};
pub use store::{collections, scan_batches, ConditionalWrite, DocumentStore, WriteGuard};
