//! External collaborators: payload storage, the ledger mirror and the primary
//! metadata store. Engines only see these traits.

pub mod blob;
pub mod ledger;
pub mod sqlite;

use crate::models::{
    BackupRecord, BackupStatus, BlobStats, LedgerStats, PrimaryStats, RecordFilter,
};
use crate::utils::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use blob::{cid_for, FsBlobStore, MemoryBlobStore};
pub use ledger::JournalLedger;
pub use sqlite::SqliteMetadataStore;

/// Content-addressed blob storage for backup payloads.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Store `payload` and return its content identifier.
    async fn put(&self, payload: Bytes) -> Result<String>;

    async fn get(&self, cid: &str) -> Result<Bytes>;

    async fn delete(&self, cid: &str) -> Result<()>;

    async fn stats(&self) -> Result<BlobStats>;
}

/// Append-only mirror of backup metadata.
///
/// `submit` is idempotent by `backup_id`: resubmitting returns the original
/// transaction id. Nothing is ever removed; status changes are new entries.
#[async_trait]
pub trait LedgerMirror: Send + Sync {
    async fn submit(&self, record: &BackupRecord) -> Result<String>;

    async fn record_status(&self, backup_id: &str, status: BackupStatus) -> Result<String>;

    async fn query_all(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>>;

    async fn query_by_id(&self, backup_id: &str) -> Result<Option<BackupRecord>>;

    async fn stats(&self) -> Result<LedgerStats>;
}

/// Fast indexed store for backup records. May be unavailable at any time.
#[async_trait]
pub trait PrimaryMetadataStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn insert(&self, record: &BackupRecord) -> Result<()>;

    async fn get(&self, backup_id: &str) -> Result<Option<BackupRecord>>;

    async fn query(&self, filter: &RecordFilter, limit: Option<usize>)
        -> Result<Vec<BackupRecord>>;

    async fn update_status(&self, backup_id: &str, status: BackupStatus) -> Result<()>;

    /// LEDGER_PENDING -> ACTIVE with the ledger transaction id. Returns false
    /// when the record was no longer pending.
    async fn mark_mirrored(&self, backup_id: &str, ledger_tx_id: &str) -> Result<bool>;

    /// Bump and return the failed mirror attempt counter.
    async fn record_mirror_attempt(&self, backup_id: &str) -> Result<u32>;

    /// Physically remove a row.
    async fn purge(&self, backup_id: &str) -> Result<bool>;

    async fn stats(&self) -> Result<PrimaryStats>;
}
