//! Fault-injecting collaborators and a seeded harness for engine tests.

use crate::config::EngineSettings;
use crate::live::{LiveData, MemoryLiveData};
use crate::models::{
    BackupRecord, BackupStatus, Dataset, LedgerStats, PrimaryStats, RecordFilter,
};
use crate::retry::RetryPolicy;
use crate::service::{Dependencies, RecoveryService};
use crate::store::{
    JournalLedger, LedgerMirror, MemoryBlobStore, PrimaryMetadataStore, SqliteMetadataStore,
};
use crate::utils::{RecoveryError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Three collections, 100 documents.
pub fn seeded_dataset() -> Dataset {
    let mut ds = Dataset::new();
    for i in 0..40 {
        ds.insert(
            "products",
            &format!("product-{i:03}"),
            json!({"name": format!("item {i}"), "price": 10 + i}),
        );
    }
    for i in 0..40 {
        ds.insert(
            "orders",
            &format!("order-{i:03}"),
            json!({"product": format!("product-{:03}", i % 40), "qty": 1 + i % 3}),
        );
    }
    for i in 0..20 {
        ds.insert(
            "customers",
            &format!("customer-{i:03}"),
            json!({"email": format!("user{i}@example.com")}),
        );
    }
    ds
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        max_chain_depth: 3,
        primary_timeout: Duration::from_millis(200),
        op_timeout: Duration::from_millis(500),
        mirror_max_attempts: 3,
        retry: RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
    }
}

/// Primary store with an outage switch, a stall switch and insert faults.
pub struct FaultyPrimary {
    inner: SqliteMetadataStore,
    down: AtomicBool,
    stalled: AtomicBool,
    reject_inserts: AtomicBool,
    hang_inserts: AtomicBool,
    late_commit: Mutex<Option<Duration>>,
}

impl FaultyPrimary {
    pub fn new(inner: SqliteMetadataStore) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            reject_inserts: AtomicBool::new(false),
            hang_inserts: AtomicBool::new(false),
            late_commit: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &SqliteMetadataStore {
        &self.inner
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Inserts fail with a non-transient error and write nothing.
    pub fn reject_inserts(&self) {
        self.reject_inserts.store(true, Ordering::SeqCst);
    }

    /// Every insert hangs; the first one still commits after `delay`, the
    /// way a timed-out blocking call finishes on its own thread.
    pub fn commit_inserts_late(&self, delay: Duration) {
        *self.late_commit.lock().unwrap() = Some(delay);
        self.hang_inserts.store(true, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(RecoveryError::Primary("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PrimaryMetadataStore for FaultyPrimary {
    async fn ping(&self) -> Result<()> {
        self.gate().await?;
        self.inner.ping().await
    }

    async fn insert(&self, record: &BackupRecord) -> Result<()> {
        self.gate().await?;
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Err(RecoveryError::InvalidRecord {
                backup_id: record.backup_id.clone(),
                reason: "injected rejection".into(),
            });
        }
        let late = self.late_commit.lock().unwrap().take();
        if let Some(delay) = late {
            let inner = self.inner.clone();
            let record = record.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = inner.insert(&record).await;
            });
        }
        if self.hang_inserts.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.insert(record).await
    }

    async fn get(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        self.gate().await?;
        self.inner.get(backup_id).await
    }

    async fn query(&self, filter: &RecordFilter, limit: Option<usize>) -> Result<Vec<BackupRecord>> {
        self.gate().await?;
        self.inner.query(filter, limit).await
    }

    async fn update_status(&self, backup_id: &str, status: BackupStatus) -> Result<()> {
        self.gate().await?;
        self.inner.update_status(backup_id, status).await
    }

    async fn mark_mirrored(&self, backup_id: &str, ledger_tx_id: &str) -> Result<bool> {
        self.gate().await?;
        self.inner.mark_mirrored(backup_id, ledger_tx_id).await
    }

    async fn record_mirror_attempt(&self, backup_id: &str) -> Result<u32> {
        self.gate().await?;
        self.inner.record_mirror_attempt(backup_id).await
    }

    async fn purge(&self, backup_id: &str) -> Result<bool> {
        self.gate().await?;
        self.inner.purge(backup_id).await
    }

    async fn stats(&self) -> Result<PrimaryStats> {
        self.gate().await?;
        self.inner.stats().await
    }
}

/// Ledger with an outage switch and silently dropped submissions.
pub struct FaultyLedger {
    inner: JournalLedger,
    down: AtomicBool,
    drop_next: AtomicBool,
}

impl FaultyLedger {
    pub fn new(inner: JournalLedger) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
            drop_next: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &JournalLedger {
        &self.inner
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// The next submission reports success but is never written.
    pub fn drop_writes_for_next(&self) {
        self.drop_next.store(true, Ordering::SeqCst);
    }

    fn gate(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RecoveryError::Ledger("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerMirror for FaultyLedger {
    async fn submit(&self, record: &BackupRecord) -> Result<String> {
        self.gate()?;
        if self.drop_next.swap(false, Ordering::SeqCst) {
            return Ok(format!("tx-dropped-{}", record.backup_id));
        }
        self.inner.submit(record).await
    }

    async fn record_status(&self, backup_id: &str, status: BackupStatus) -> Result<String> {
        self.gate()?;
        self.inner.record_status(backup_id, status).await
    }

    async fn query_all(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>> {
        self.gate()?;
        self.inner.query_all(filter).await
    }

    async fn query_by_id(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        self.gate()?;
        self.inner.query_by_id(backup_id).await
    }

    async fn stats(&self) -> Result<LedgerStats> {
        self.gate()?;
        self.inner.stats().await
    }
}

/// Live data that counts swaps and can lose or observe them.
#[derive(Default)]
pub struct HookedLive {
    inner: MemoryLiveData,
    swaps: AtomicUsize,
    lose_at: AtomicUsize,
    break_at: AtomicUsize,
    cancel_on_swap: Mutex<Option<CancellationToken>>,
}

impl HookedLive {
    pub fn new(initial: Dataset) -> Self {
        Self {
            inner: MemoryLiveData::new(initial),
            ..Default::default()
        }
    }

    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Dataset),
    {
        self.inner.update(f).await;
    }

    pub async fn replace(&self, dataset: Dataset) {
        self.inner.replace(dataset).await;
    }

    pub async fn snapshot_now(&self) -> Dataset {
        self.inner.snapshot().await.unwrap()
    }

    pub fn swap_count(&self) -> usize {
        self.swaps.load(Ordering::SeqCst)
    }

    pub fn lose_next_swap(&self) {
        self.lose_swap_number(1);
    }

    /// Drop the n-th swap from now (1-based).
    pub fn lose_swap_number(&self, n: usize) {
        self.lose_at
            .store(self.swap_count() + n, Ordering::SeqCst);
    }

    /// The n-th swap from now (1-based) wipes live data and then errors.
    pub fn break_swap_number(&self, n: usize) {
        self.break_at
            .store(self.swap_count() + n, Ordering::SeqCst);
    }

    pub fn cancel_on_first_swap(&self, token: CancellationToken) {
        *self.cancel_on_swap.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl LiveData for HookedLive {
    async fn snapshot(&self) -> Result<Dataset> {
        self.inner.snapshot().await
    }

    async fn swap(&self, staged: Dataset) -> Result<()> {
        let n = self.swaps.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.cancel_on_swap.lock().unwrap().take();
        if let Some(token) = token {
            token.cancel();
        }
        if self.lose_at.load(Ordering::SeqCst) == n {
            return Ok(());
        }
        if self.break_at.load(Ordering::SeqCst) == n {
            self.inner.replace(Dataset::new()).await;
            return Err(RecoveryError::Io(std::io::Error::other("injected swap failure")));
        }
        self.inner.swap(staged).await
    }

    async fn merge(&self, staged: &Dataset) -> Result<usize> {
        self.inner.merge(staged).await
    }
}

pub struct Harness {
    _dir: TempDir,
    pub storage: Arc<MemoryBlobStore>,
    pub ledger: Arc<FaultyLedger>,
    pub primary: Arc<FaultyPrimary>,
    pub live: Arc<HookedLive>,
    pub settings: EngineSettings,
    pub service: RecoveryService,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryBlobStore::new());
        let ledger = Arc::new(FaultyLedger::new(JournalLedger::in_memory()));
        let primary = Arc::new(FaultyPrimary::new(
            SqliteMetadataStore::open(dir.path().join("primary.db")).unwrap(),
        ));
        let live = Arc::new(HookedLive::new(seeded_dataset()));
        let settings = fast_settings();

        let service = RecoveryService::new(
            Dependencies {
                storage: storage.clone(),
                ledger: ledger.clone(),
                primary: primary.clone(),
                live: live.clone(),
            },
            settings.clone(),
        );

        Self {
            _dir: dir,
            storage,
            ledger,
            primary,
            live,
            settings,
            service,
        }
    }

    /// Create a FULL backup and wait for it to be mirrored.
    pub async fn full_backup(&self) -> BackupRecord {
        let record = self.service.create_full_backup("admin-1").await.unwrap();
        self.service.backups().wait_for_mirrors().await;
        record
    }

    pub async fn incremental_backup(&self, parent_id: &str) -> BackupRecord {
        let created = self
            .service
            .create_incremental_backup(parent_id, "admin-1")
            .await
            .unwrap();
        self.service.backups().wait_for_mirrors().await;
        created.record
    }

    pub async fn live_checksum(&self) -> String {
        self.live.snapshot_now().await.checksum()
    }
}
