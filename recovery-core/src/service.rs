//! One handle over every engine, built from injected collaborators.

use crate::config::{Config, EngineSettings};
use crate::engine::backup::{BackupEngine, CreatedBackup, SweepReport};
use crate::engine::emergency::{EmergencyRecoveryCoordinator, RecoveryReport};
use crate::engine::list::{ListQueryService, ListResult};
use crate::engine::reconcile::{ReconciliationService, VerifyReport};
use crate::engine::restore::{RestoreEngine, RestoreReport, RestoreState};
use crate::engine::retention::{CleanupReport, DeleteAck, RetentionManager, RetentionPolicy};
use crate::engine::EngineContext;
use crate::live::LiveData;
use crate::lock::OperationLocks;
use crate::models::{BackupRecord, LedgerStats, MetadataSource, RecordFilter, StorageStats};
use crate::retry::with_timeout;
use crate::store::{
    FsBlobStore, JournalLedger, LedgerMirror, PrimaryMetadataStore, SqliteMetadataStore,
    StorageAdapter,
};
use crate::utils::Result;
use std::sync::Arc;

pub struct Dependencies {
    pub storage: Arc<dyn StorageAdapter>,
    pub ledger: Arc<dyn LedgerMirror>,
    pub primary: Arc<dyn PrimaryMetadataStore>,
    pub live: Arc<dyn LiveData>,
}

impl Dependencies {
    /// On-disk adapters laid out under the configured data directory.
    pub async fn open(config: &Config, live: Arc<dyn LiveData>) -> Result<Self> {
        let storage = FsBlobStore::open(config.blob_dir(), config.storage.compression_level)?;
        let primary = SqliteMetadataStore::open(config.db_path())?;
        let ledger = JournalLedger::open(config.ledger_path()).await?;
        tracing::info!(
            data_dir = %config.storage.data_dir.display(),
            "Recovery stores opened"
        );
        Ok(Self {
            storage: Arc::new(storage),
            ledger: Arc::new(ledger),
            primary: Arc::new(primary),
            live,
        })
    }
}

pub struct RecoveryService {
    ctx: Arc<EngineContext>,
    backups: BackupEngine,
    queries: ListQueryService,
    reconciler: ReconciliationService,
    restores: Arc<RestoreEngine>,
    emergency: EmergencyRecoveryCoordinator,
    retention: RetentionManager,
}

impl RecoveryService {
    pub fn new(deps: Dependencies, settings: EngineSettings) -> Self {
        let ctx = Arc::new(EngineContext {
            storage: deps.storage,
            ledger: deps.ledger,
            primary: deps.primary,
            live: deps.live,
            locks: OperationLocks::new(),
            settings,
        });
        let restores = Arc::new(RestoreEngine::new(ctx.clone()));

        Self {
            backups: BackupEngine::new(ctx.clone()),
            queries: ListQueryService::new(ctx.clone()),
            reconciler: ReconciliationService::new(ctx.clone()),
            emergency: EmergencyRecoveryCoordinator::new(ctx.clone(), restores.clone()),
            retention: RetentionManager::new(ctx.clone()),
            restores,
            ctx,
        }
    }

    pub fn backups(&self) -> &BackupEngine {
        &self.backups
    }

    pub fn restores(&self) -> &RestoreEngine {
        &self.restores
    }

    pub fn locks(&self) -> &OperationLocks {
        &self.ctx.locks
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.ctx.settings
    }

    pub async fn create_full_backup(&self, triggered_by: &str) -> Result<BackupRecord> {
        self.backups.create_full(triggered_by).await
    }

    pub async fn create_incremental_backup(
        &self,
        parent_id: &str,
        triggered_by: &str,
    ) -> Result<CreatedBackup> {
        self.backups.create_incremental(parent_id, triggered_by).await
    }

    pub async fn retry_pending(&self) -> Result<SweepReport> {
        self.backups.retry_pending().await
    }

    pub async fn list_backups(&self, filter: &RecordFilter, limit: Option<usize>) -> ListResult {
        self.queries.list(filter, limit).await
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<(BackupRecord, MetadataSource)> {
        self.queries.get(backup_id).await
    }

    pub async fn verify_backup(&self, backup_id: &str) -> VerifyReport {
        self.reconciler.verify(backup_id).await
    }

    pub async fn restore_full(&self, backup_id: &str, safe_mode: bool) -> Result<RestoreReport> {
        self.restores.restore_full(backup_id, safe_mode).await
    }

    pub async fn restore_chain(&self, backup_id: &str) -> Result<RestoreReport> {
        self.restores.restore_chain(backup_id).await
    }

    pub fn restore_state(&self) -> RestoreState {
        self.restores.state()
    }

    pub fn cancel_restore(&self) -> bool {
        self.restores.cancel()
    }

    pub async fn emergency_recovery(&self) -> Result<RecoveryReport> {
        self.emergency.emergency_recovery().await
    }

    pub async fn delete_backup(&self, backup_id: &str) -> Result<DeleteAck> {
        self.retention.delete_backup(backup_id).await
    }

    pub async fn delete_backup_with(&self, backup_id: &str, purge: bool) -> Result<DeleteAck> {
        self.retention.delete_with(backup_id, purge).await
    }

    pub async fn cleanup_old_backups(&self, policy: &RetentionPolicy) -> CleanupReport {
        self.retention.cleanup_old_backups(policy).await
    }

    /// Blob totals plus primary counts; the primary part is omitted while
    /// the primary store is unreachable.
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let settings = &self.ctx.settings;
        let blobs = settings
            .retry
            .run("storage.stats", settings.op_timeout, || self.ctx.storage.stats())
            .await
            .map_err(|e| e.into_storage("storage.stats"))?;
        let primary = match with_timeout(
            "primary.stats",
            settings.primary_timeout,
            self.ctx.primary.stats(),
        )
        .await
        {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %e, "Primary stats unavailable");
                None
            }
        };
        Ok(StorageStats { blobs, primary })
    }

    pub async fn ledger_stats(&self) -> Result<LedgerStats> {
        let settings = &self.ctx.settings;
        settings
            .retry
            .run_ledger("ledger.stats", settings.op_timeout, || self.ctx.ledger.stats())
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::Harness;

    #[tokio::test]
    async fn test_stats_cover_both_stores() {
        let h = Harness::new().await;
        h.full_backup().await;
        h.full_backup().await;

        let storage = h.service.storage_stats().await.unwrap();
        assert_eq!(storage.blobs.blob_count, 2);
        let primary = storage.primary.unwrap();
        assert_eq!(primary.total, 2);
        assert_eq!(primary.by_status.get("ACTIVE"), Some(&2));

        let ledger = h.service.ledger_stats().await.unwrap();
        assert_eq!(ledger.backups, 2);
        assert_eq!(ledger.by_type.get("FULL"), Some(&2));

        h.primary.set_down(true);
        let storage = h.service.storage_stats().await.unwrap();
        assert!(storage.primary.is_none());
    }

    #[tokio::test]
    async fn test_open_lays_out_stores_under_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = crate::Config::default();
        config.storage.data_dir = dir.path().to_path_buf();

        let live = std::sync::Arc::new(crate::live::MemoryLiveData::new(
            crate::testutil::seeded_dataset(),
        ));
        let deps = super::Dependencies::open(&config, live).await.unwrap();
        let service = super::RecoveryService::new(deps, config.engine_settings());
        let record = service.create_full_backup("admin-1").await.unwrap();
        service.backups().wait_for_mirrors().await;

        assert!(config.db_path().exists());
        assert!(config.ledger_path().exists());
        let (found, _) = service.get_backup(&record.backup_id).await.unwrap();
        assert_eq!(found.cid, record.cid);
    }
}
