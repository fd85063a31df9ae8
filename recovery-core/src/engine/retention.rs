//! Dependency-aware retention.
//!
//! Candidates are picked by age and by count per type, then any candidate
//! that still has a live child outside the candidate set is kept. Deletion
//! runs children first, so a FULL only goes once its whole subtree is gone.
//! Deletes hold the retention lock, so they never overlap a backup or a
//! restore, and a record whose ledger mirror is still pending is left alone.

use super::EngineContext;
use crate::lock::{LockGuard, OpKind};
use crate::models::{BackupRecord, BackupStatus, RecordFilter};
use crate::retry::with_timeout;
use crate::utils::{RecoveryError, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub max_age_days: Option<i64>,
    #[serde(default)]
    pub max_count_per_type: Option<usize>,
    /// Remove the primary row after the ledger has recorded the deletion
    #[serde(default)]
    pub purge_primary: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub deleted_ids: Vec<String>,
    /// Candidates kept because a live backup still depends on them
    pub retained_for_dependents: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteAck {
    pub backup_id: String,
    pub already_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_tx_id: Option<String>,
    pub blob_deleted: bool,
    pub purged: bool,
}

/// Pick deletion candidates from ACTIVE records. Returns `(delete, retained)`,
/// with `delete` ordered children first.
pub fn plan_cleanup(
    records: &[BackupRecord],
    policy: &RetentionPolicy,
    now: chrono::DateTime<Utc>,
) -> (Vec<String>, Vec<String>) {
    let active: Vec<&BackupRecord> = records.iter().filter(|r| r.is_active()).collect();
    let mut candidates: HashSet<String> = HashSet::new();

    if let Some(days) = policy.max_age_days {
        let cutoff = now - Duration::days(days);
        candidates.extend(
            active
                .iter()
                .filter(|r| r.created_at < cutoff)
                .map(|r| r.backup_id.clone()),
        );
    }

    if let Some(keep) = policy.max_count_per_type {
        let mut by_type: BTreeMap<&str, Vec<&BackupRecord>> = BTreeMap::new();
        for record in &active {
            by_type
                .entry(record.backup_type.as_str())
                .or_default()
                .push(record);
        }
        for group in by_type.values_mut() {
            group.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| a.backup_id.cmp(&b.backup_id))
            });
            candidates.extend(group.iter().skip(keep).map(|r| r.backup_id.clone()));
        }
    }

    // Children that would survive keep their parents alive; repeat until stable
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for record in records.iter().filter(|r| is_live(r.status)) {
        if let Some(parent) = record.parent_backup_id.as_deref() {
            children
                .entry(parent)
                .or_default()
                .push(record.backup_id.as_str());
        }
    }
    let mut retained: Vec<String> = Vec::new();
    loop {
        let blocked: Vec<String> = candidates
            .iter()
            .filter(|id| {
                children
                    .get(id.as_str())
                    .is_some_and(|kids| kids.iter().any(|k| !candidates.contains(*k)))
            })
            .cloned()
            .collect();
        if blocked.is_empty() {
            break;
        }
        for id in blocked {
            candidates.remove(&id);
            retained.push(id);
        }
    }
    retained.sort();

    let by_id: HashMap<&str, &BackupRecord> =
        records.iter().map(|r| (r.backup_id.as_str(), r)).collect();
    let depth = |id: &str| {
        let mut depth = 0usize;
        let mut seen = HashSet::new();
        let mut current = by_id.get(id).and_then(|r| r.parent_backup_id.as_deref());
        while let Some(parent) = current {
            if !seen.insert(parent) {
                break;
            }
            depth += 1;
            current = by_id.get(parent).and_then(|r| r.parent_backup_id.as_deref());
        }
        depth
    };
    let mut delete: Vec<String> = candidates.into_iter().collect();
    delete.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));

    (delete, retained)
}

fn is_live(status: BackupStatus) -> bool {
    matches!(status, BackupStatus::Active | BackupStatus::LedgerPending)
}

pub struct RetentionManager {
    ctx: Arc<EngineContext>,
}

impl RetentionManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Never fails as a whole; per-backup failures land in `errors`.
    pub async fn cleanup_old_backups(&self, policy: &RetentionPolicy) -> CleanupReport {
        let mut report = CleanupReport::default();

        let guard = match self.ctx.locks.try_acquire(OpKind::Retention) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(error = %e, "Retention skipped, another operation is running");
                report.errors.push(e.to_string());
                return report;
            }
        };

        let records = match with_timeout(
            "primary.query",
            self.ctx.settings.primary_timeout,
            self.ctx.primary.query(&RecordFilter::default(), None),
        )
        .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Retention skipped, primary store unavailable");
                report.errors.push(format!("primary: {e}"));
                return report;
            }
        };

        let (delete, retained) = plan_cleanup(&records, policy, Utc::now());
        for id in &retained {
            tracing::info!(backup_id = %id, "Retention candidate kept for active dependents");
        }
        report.retained_for_dependents = retained;

        for id in delete {
            match self.delete_locked(&guard, &id, policy.purge_primary).await {
                Ok(_) => report.deleted_ids.push(id),
                Err(e) => {
                    tracing::warn!(backup_id = %id, error = %e, "Retention delete failed");
                    report.errors.push(format!("{id}: {e}"));
                }
            }
        }

        tracing::info!(
            deleted = report.deleted_ids.len(),
            retained = report.retained_for_dependents.len(),
            errors = report.errors.len(),
            "Retention cleanup finished"
        );
        report
    }

    pub async fn delete_backup(&self, backup_id: &str) -> Result<DeleteAck> {
        self.delete_with(backup_id, false).await
    }

    /// Delete one backup, optionally removing its primary row afterwards.
    pub async fn delete_with(&self, backup_id: &str, purge: bool) -> Result<DeleteAck> {
        let guard = self.ctx.locks.try_acquire(OpKind::Retention)?;
        self.delete_locked(&guard, backup_id, purge).await
    }

    async fn delete_locked(
        &self,
        guard: &LockGuard,
        backup_id: &str,
        purge: bool,
    ) -> Result<DeleteAck> {
        debug_assert_eq!(guard.kind(), OpKind::Retention);
        let settings = &self.ctx.settings;
        let record = self
            .ctx
            .primary_get(backup_id)
            .await?
            .ok_or_else(|| RecoveryError::not_found(backup_id))?;

        if record.status == BackupStatus::Deleted {
            return Ok(DeleteAck {
                backup_id: backup_id.to_string(),
                already_deleted: true,
                ledger_tx_id: None,
                blob_deleted: false,
                purged: false,
            });
        }
        if record.status == BackupStatus::LedgerPending {
            return Err(RecoveryError::InvalidState {
                backup_id: backup_id.to_string(),
                reason: "ledger mirror still pending".into(),
            });
        }

        let dependents: Vec<String> = with_timeout(
            "primary.query",
            settings.primary_timeout,
            self.ctx.primary.query(&RecordFilter::children_of(backup_id), None),
        )
        .await?
        .into_iter()
        .filter(|r| is_live(r.status))
        .map(|r| r.backup_id)
        .collect();
        if !dependents.is_empty() {
            return Err(RecoveryError::DependentsActive {
                backup_id: backup_id.to_string(),
                dependents,
            });
        }

        // Ledger first: if the audit trail cannot take the change, nothing moves
        let ledger_tx_id = match settings
            .retry
            .run_ledger("ledger.record_status", settings.op_timeout, || {
                self.ctx.ledger.record_status(backup_id, BackupStatus::Deleted)
            })
            .await
        {
            Ok(tx) => Some(tx),
            Err(RecoveryError::NotFound { .. }) => {
                tracing::warn!(
                    backup_id,
                    status = %record.status,
                    "Backup has no ledger entry, deleting from primary only"
                );
                None
            }
            Err(e) => return Err(e),
        };

        with_timeout(
            "primary.update_status",
            settings.primary_timeout,
            self.ctx.primary.update_status(backup_id, BackupStatus::Deleted),
        )
        .await?;

        let blob_deleted = match settings
            .retry
            .run("storage.delete", settings.op_timeout, || {
                self.ctx.storage.delete(&record.cid)
            })
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backup_id, cid = %record.cid, error = %e, "Payload left in storage");
                false
            }
        };

        let purged = if purge {
            with_timeout(
                "primary.purge",
                settings.primary_timeout,
                self.ctx.primary.purge(backup_id),
            )
            .await?
        } else {
            false
        };

        tracing::info!(backup_id, backup_type = %record.backup_type, purged, "Backup deleted");
        Ok(DeleteAck {
            backup_id: backup_id.to_string(),
            already_deleted: false,
            ledger_tx_id,
            blob_deleted,
            purged,
        })
    }
}
