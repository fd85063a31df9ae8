//! Backup creation and ledger mirroring.
//!
//! A backup is stored and recorded as LEDGER_PENDING while the backup lock is
//! held; mirroring to the ledger happens afterwards on a background task.
//! Each backup id is mirrored by at most one task at a time.

use super::chain::load_chain;
use super::stage::materialize;
use super::EngineContext;
use crate::lock::{LockGuard, OpKind};
use crate::models::{
    BackupPayload, BackupRecord, BackupStatus, BackupType, Dataset, RecordFilter,
};
use crate::retry::with_timeout;
use crate::utils::{RecoveryError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Serialize)]
pub struct CreatedBackup {
    pub record: BackupRecord,
    /// Set when an incremental request was escalated to a new FULL
    pub chain_reset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MirrorOutcome {
    Mirrored { ledger_tx_id: String },
    Pending { attempts: u32 },
    Failed { attempts: u32 },
    /// Another task is already mirroring this id
    Skipped,
    /// The primary row left LEDGER_PENDING while the submission was in
    /// flight; the ledger was given the row's current status
    Superseded { status: BackupStatus },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub mirrored: usize,
    pub pending: usize,
    pub failed: usize,
    pub superseded: usize,
}

struct NewBackup<'a> {
    backup_id: String,
    backup_type: BackupType,
    parent_backup_id: Option<String>,
    checksum: String,
    triggered_by: &'a str,
    created_at: DateTime<Utc>,
    payload: BackupPayload,
}

pub struct BackupEngine {
    ctx: Arc<EngineContext>,
    mirror: Mirror,
    tracker: TaskTracker,
}

impl BackupEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            mirror: Mirror {
                ctx: ctx.clone(),
                in_flight: Arc::new(Mutex::new(HashSet::new())),
            },
            ctx,
            tracker: TaskTracker::new(),
        }
    }

    pub async fn create_full(&self, triggered_by: &str) -> Result<BackupRecord> {
        let guard = self.ctx.locks.try_acquire(OpKind::Backup)?;
        let record = self.create_full_locked(&guard, triggered_by).await?;
        drop(guard);

        self.spawn_mirror(record.clone());
        Ok(record)
    }

    pub async fn create_incremental(
        &self,
        parent_id: &str,
        triggered_by: &str,
    ) -> Result<CreatedBackup> {
        let guard = self.ctx.locks.try_acquire(OpKind::Backup)?;

        let parent = self
            .ctx
            .primary_get(parent_id)
            .await?
            .ok_or_else(|| RecoveryError::not_found(parent_id))?;
        if !parent.is_active() {
            return Err(RecoveryError::invalid_state(
                parent_id,
                format!("parent status is {}", parent.status),
            ));
        }

        let (chain, _) = load_chain(&self.ctx, parent_id).await?;
        if chain.incrementals() >= self.ctx.settings.max_chain_depth {
            tracing::info!(
                parent_id,
                depth = chain.incrementals(),
                max_chain_depth = self.ctx.settings.max_chain_depth,
                "Chain depth limit reached, escalating to FULL backup"
            );
            let record = self.create_full_locked(&guard, triggered_by).await?;
            drop(guard);
            self.spawn_mirror(record.clone());
            return Ok(CreatedBackup {
                record,
                chain_reset: true,
            });
        }

        let staged = materialize(&self.ctx, &chain).await?;
        let base: &Dataset = staged
            .last()
            .map(|link| &link.state)
            .ok_or_else(|| RecoveryError::chain_broken(parent_id, "empty chain"))?;

        let snapshot = self.ctx.live.snapshot().await?;
        let diff = snapshot.diff_from(base);
        let backup_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            %backup_id,
            parent_id,
            changed_documents = diff.changed_documents(),
            "Computed incremental diff"
        );

        let record = self
            .persist(NewBackup {
                backup_type: BackupType::Incremental,
                parent_backup_id: Some(parent_id.to_string()),
                checksum: snapshot.checksum(),
                triggered_by,
                // Children never predate their parent, even under clock skew
                created_at: Utc::now().max(parent.created_at),
                payload: BackupPayload::Incremental {
                    backup_id: backup_id.clone(),
                    parent_checksum: parent.checksum.clone(),
                    diff,
                },
                backup_id,
            })
            .await?;
        drop(guard);

        self.spawn_mirror(record.clone());
        Ok(CreatedBackup {
            record,
            chain_reset: false,
        })
    }

    async fn create_full_locked(
        &self,
        _guard: &LockGuard,
        triggered_by: &str,
    ) -> Result<BackupRecord> {
        let snapshot = self.ctx.live.snapshot().await?;
        let backup_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            %backup_id,
            collections = snapshot.collection_count(),
            documents = snapshot.document_count(),
            "Snapshot taken"
        );

        self.persist(NewBackup {
            backup_type: BackupType::Full,
            parent_backup_id: None,
            checksum: snapshot.checksum(),
            triggered_by,
            created_at: Utc::now(),
            payload: BackupPayload::Full {
                backup_id: backup_id.clone(),
                dataset: snapshot,
            },
            backup_id,
        })
        .await
    }

    /// Store the payload, then record it. A recorded row always has its payload.
    async fn persist(&self, new: NewBackup<'_>) -> Result<BackupRecord> {
        let settings = &self.ctx.settings;
        let bytes = Bytes::from(new.payload.encode()?);
        let size_bytes = bytes.len() as u64;

        let cid = settings
            .retry
            .run("storage.put", settings.op_timeout, || {
                self.ctx.storage.put(bytes.clone())
            })
            .await
            .map_err(|e| e.into_storage("storage.put"))?;

        let record = BackupRecord {
            backup_id: new.backup_id,
            backup_type: new.backup_type,
            status: BackupStatus::LedgerPending,
            created_at: new.created_at,
            triggered_by: new.triggered_by.to_string(),
            cid,
            checksum: new.checksum,
            size_bytes,
            parent_backup_id: new.parent_backup_id,
            ledger_tx_id: None,
        };

        let inserted = settings
            .retry
            .run("primary.insert", settings.primary_timeout, || {
                self.ctx.primary.insert(&record)
            })
            .await;
        if let Err(e) = inserted {
            self.settle_failed_insert(&record, e).await?;
        }

        tracing::info!(
            backup_id = %record.backup_id,
            backup_type = %record.backup_type,
            cid = %record.cid,
            size_bytes,
            "Backup created"
        );
        Ok(record)
    }

    /// A failed insert may still commit later: a timed-out attempt keeps
    /// running on the blocking pool. The payload is only removed once the
    /// row is confirmed absent and no attempt can still land.
    async fn settle_failed_insert(&self, record: &BackupRecord, err: RecoveryError) -> Result<()> {
        let settings = &self.ctx.settings;
        let backup_id = record.backup_id.as_str();
        let existing = with_timeout(
            "primary.get",
            settings.primary_timeout,
            self.ctx.primary.get(backup_id),
        )
        .await;

        match existing {
            Ok(Some(row)) if row.same_identity(record) => {
                tracing::warn!(backup_id, error = %err, "Insert reported failure but the row was committed");
                Ok(())
            }
            Ok(None) if !err.is_transient() => {
                tracing::error!(backup_id, error = %err, "Failed to record backup, removing stored payload");
                if let Err(del) = self.ctx.storage.delete(&record.cid).await {
                    tracing::warn!(cid = %record.cid, error = %del, "Orphaned payload left in storage");
                }
                Err(err)
            }
            _ => {
                tracing::error!(
                    backup_id,
                    cid = %record.cid,
                    error = %err,
                    "Failed to record backup, keeping payload in case the insert lands"
                );
                Err(err)
            }
        }
    }

    fn spawn_mirror(&self, record: BackupRecord) {
        let mirror = self.mirror.clone();
        self.tracker.spawn(async move {
            mirror.mirror(record).await;
        });
    }

    /// Mirror one record now, on the calling task.
    pub async fn mirror_record(&self, record: BackupRecord) -> MirrorOutcome {
        self.mirror.mirror(record).await
    }

    /// Wait until every mirror task spawned so far has finished.
    pub async fn wait_for_mirrors(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Re-mirror every LEDGER_PENDING record. Distinct ids run concurrently.
    pub async fn retry_pending(&self) -> Result<SweepReport> {
        let pending = with_timeout(
            "primary.query",
            self.ctx.settings.primary_timeout,
            self.ctx
                .primary
                .query(&RecordFilter::with_status(BackupStatus::LedgerPending), None),
        )
        .await?;

        let mut report = SweepReport {
            scanned: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let outcomes = futures_util::future::join_all(
            pending
                .into_iter()
                .map(|record| self.mirror.mirror(record)),
        )
        .await;

        for outcome in outcomes {
            match outcome {
                MirrorOutcome::Mirrored { .. } => report.mirrored += 1,
                MirrorOutcome::Pending { .. } | MirrorOutcome::Skipped => report.pending += 1,
                MirrorOutcome::Failed { .. } => report.failed += 1,
                MirrorOutcome::Superseded { .. } => report.superseded += 1,
            }
        }
        tracing::info!(
            scanned = report.scanned,
            mirrored = report.mirrored,
            pending = report.pending,
            failed = report.failed,
            "Ledger-pending sweep finished"
        );
        Ok(report)
    }
}

#[derive(Clone)]
struct Mirror {
    ctx: Arc<EngineContext>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Mirror {
    async fn mirror(&self, record: BackupRecord) -> MirrorOutcome {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(record.backup_id.clone()) {
                tracing::debug!(backup_id = %record.backup_id, "Mirror already in flight");
                return MirrorOutcome::Skipped;
            }
        }

        let outcome = self.mirror_inner(&record).await;

        self.in_flight.lock().await.remove(&record.backup_id);
        outcome
    }

    async fn settle_superseded(&self, backup_id: &str, tx: String) -> MirrorOutcome {
        let ctx = &self.ctx;
        let current = match with_timeout(
            "primary.get",
            ctx.settings.primary_timeout,
            ctx.primary.get(backup_id),
        )
        .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(backup_id, error = %e, "Mirrored but primary row could not be read");
                return MirrorOutcome::Pending { attempts: 0 };
            }
        };

        // A purged row counts as deleted
        let status = match current {
            Some(row) if row.status == BackupStatus::Active => {
                return MirrorOutcome::Mirrored {
                    ledger_tx_id: row.ledger_tx_id.unwrap_or(tx),
                };
            }
            Some(row) if row.status == BackupStatus::LedgerPending => {
                return MirrorOutcome::Pending { attempts: 0 };
            }
            Some(row) => row.status,
            None => BackupStatus::Deleted,
        };

        let aligned = ctx
            .settings
            .retry
            .run_ledger("ledger.record_status", ctx.settings.op_timeout, || {
                ctx.ledger.record_status(backup_id, status)
            })
            .await;
        match aligned {
            Ok(status_tx) => tracing::warn!(
                backup_id,
                %status,
                ledger_tx_id = %status_tx,
                "Primary row changed during mirror, ledger status aligned"
            ),
            Err(e) => tracing::error!(
                backup_id,
                %status,
                error = %e,
                "Ledger shows ACTIVE for a backup the primary no longer treats as live"
            ),
        }
        MirrorOutcome::Superseded { status }
    }

    async fn mirror_inner(&self, record: &BackupRecord) -> MirrorOutcome {
        let ctx = &self.ctx;
        let backup_id = record.backup_id.as_str();

        let mut submitted = record.clone();
        submitted.status = BackupStatus::Active;
        submitted.ledger_tx_id = None;

        let submit = ctx
            .settings
            .retry
            .run_ledger("ledger.submit", ctx.settings.op_timeout, || {
                ctx.ledger.submit(&submitted)
            })
            .await;

        match submit {
            Ok(tx) => {
                let marked = with_timeout(
                    "primary.mark_mirrored",
                    ctx.settings.primary_timeout,
                    ctx.primary.mark_mirrored(backup_id, &tx),
                )
                .await;
                match marked {
                    Ok(false) => self.settle_superseded(backup_id, tx).await,
                    Ok(true) => {
                        tracing::info!(backup_id, ledger_tx_id = %tx, "Backup mirrored to ledger");
                        MirrorOutcome::Mirrored { ledger_tx_id: tx }
                    }
                    Err(e) => {
                        // Resubmission is idempotent; the sweeper will finish this
                        tracing::warn!(
                            backup_id,
                            error = %e,
                            "Mirrored but primary status not updated"
                        );
                        MirrorOutcome::Pending { attempts: 0 }
                    }
                }
            }
            Err(e) => {
                let attempts = match with_timeout(
                    "primary.record_mirror_attempt",
                    ctx.settings.primary_timeout,
                    ctx.primary.record_mirror_attempt(backup_id),
                )
                .await
                {
                    Ok(n) => n,
                    Err(count_err) => {
                        tracing::warn!(
                            backup_id,
                            error = %e,
                            count_error = %count_err,
                            "Mirror failed and attempt could not be counted"
                        );
                        return MirrorOutcome::Pending { attempts: 0 };
                    }
                };

                if attempts >= ctx.settings.mirror_max_attempts {
                    tracing::error!(
                        backup_id,
                        attempts,
                        error = %e,
                        "Mirror attempts exhausted, marking backup FAILED"
                    );
                    if let Err(mark_err) = ctx
                        .primary
                        .update_status(backup_id, BackupStatus::Failed)
                        .await
                    {
                        tracing::warn!(backup_id, error = %mark_err, "Failed to mark backup FAILED");
                        return MirrorOutcome::Pending { attempts };
                    }
                    MirrorOutcome::Failed { attempts }
                } else {
                    tracing::warn!(backup_id, attempts, error = %e, "Mirror attempt failed");
                    MirrorOutcome::Pending { attempts }
                }
            }
        }
    }
}
