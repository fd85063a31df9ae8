//! Backup, query, restore and retention engines.
//!
//! Every engine holds the same [`EngineContext`]: the three collaborators,
//! the live data, the shared operation locks and the runtime settings.

pub mod backup;
pub mod chain;
pub mod emergency;
pub mod list;
pub mod reconcile;
pub mod restore;
pub mod retention;
pub mod stage;

use crate::config::EngineSettings;
use crate::live::LiveData;
use crate::lock::OperationLocks;
use crate::models::{BackupRecord, MetadataSource};
use crate::retry::with_timeout;
use crate::store::{LedgerMirror, PrimaryMetadataStore, StorageAdapter};
use crate::utils::{RecoveryError, Result};
use std::sync::Arc;

pub struct EngineContext {
    pub storage: Arc<dyn StorageAdapter>,
    pub ledger: Arc<dyn LedgerMirror>,
    pub primary: Arc<dyn PrimaryMetadataStore>,
    pub live: Arc<dyn LiveData>,
    pub locks: OperationLocks,
    pub settings: EngineSettings,
}

impl EngineContext {
    /// Primary read bounded by `primary_timeout`.
    pub(crate) async fn primary_get(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        with_timeout(
            "primary.get",
            self.settings.primary_timeout,
            self.primary.get(backup_id),
        )
        .await
    }

    pub(crate) async fn ledger_get(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        self.settings
            .retry
            .run_ledger("ledger.query_by_id", self.settings.op_timeout, || {
                self.ledger.query_by_id(backup_id)
            })
            .await
    }

    /// Find a record in the primary store, falling back to the ledger when the
    /// primary fails or does not know the id.
    pub(crate) async fn lookup_record(
        &self,
        backup_id: &str,
    ) -> Result<(BackupRecord, MetadataSource)> {
        let primary_err = match self.primary_get(backup_id).await {
            Ok(Some(record)) => return Ok((record, MetadataSource::Primary)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(backup_id, error = %e, "Primary lookup failed, trying ledger");
                Some(e)
            }
        };

        match self.ledger_get(backup_id).await {
            Ok(Some(record)) => Ok((record, MetadataSource::Ledger)),
            Ok(None) => Err(RecoveryError::not_found(backup_id)),
            // Both stores down: the ledger failure is what the caller must see
            Err(e) if primary_err.is_some() => Err(e),
            Err(e) => {
                tracing::warn!(backup_id, error = %e, "Ledger lookup failed after primary miss");
                Err(RecoveryError::not_found(backup_id))
            }
        }
    }
}
