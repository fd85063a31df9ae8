//! Restore engine.
//!
//! ```text
//! IDLE -> VALIDATING -> STAGING -> APPLYING -> VERIFYING -> COMPLETE | FAILED
//! ```
//!
//! The restore lock is held from VALIDATING until the final state. Every
//! payload is fetched and checked before live data is touched. Each chain
//! link is an atomic checkpoint: it is applied by swapping in its fully staged
//! state, verified, and rolled back to the previous checkpoint on failure.
//! Cancellation is only honored between links.

use super::chain::{load_chain, Chain};
use super::stage::{materialize, StagedLink};
use super::EngineContext;
use crate::lock::{LockGuard, OpKind};
use crate::models::{BackupType, Dataset, MetadataSource};
use crate::utils::{RecoveryError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreState {
    Idle,
    Validating,
    Staging,
    Applying,
    Verifying,
    Complete,
    Failed,
}

impl RestoreState {
    fn is_running(self) -> bool {
        !matches!(
            self,
            RestoreState::Idle | RestoreState::Complete | RestoreState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Live collections are replaced by the backup
    Destructive,
    /// Backup documents are upserted; nothing live is dropped
    Safe,
    Chain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Applied,
    /// Live data was already at this link's checkpoint
    AlreadyApplied,
    Failed,
    NotAttempted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub status: StepStatus,
    pub documents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub mode: RestoreMode,
    pub source: MetadataSource,
    pub final_state: RestoreState,
    pub collections_restored: usize,
    pub documents_restored: usize,
    pub steps: Vec<StepOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A chain run always yields a report; `error` is set when it ended FAILED.
pub(crate) struct ChainRun {
    pub report: RestoreReport,
    pub error: Option<RecoveryError>,
}

pub struct RestoreEngine {
    ctx: Arc<EngineContext>,
    state: Mutex<RestoreState>,
    cancel: Mutex<CancellationToken>,
}

impl RestoreEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(RestoreState::Idle),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn state(&self) -> RestoreState {
        *lock(&self.state)
    }

    /// Token observed by the next (or current) chain restore. A fresh one is
    /// installed whenever a restore finishes.
    pub fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    /// Ask the running restore to stop at the next link boundary. Returns
    /// false when nothing is running.
    pub fn cancel(&self) -> bool {
        if !self.state().is_running() {
            return false;
        }
        tracing::info!("Restore cancellation requested");
        lock(&self.cancel).cancel();
        true
    }

    fn set_state(&self, next: RestoreState) {
        let mut state = lock(&self.state);
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "Restore state change");
            *state = next;
        }
    }

    fn finish(&self, final_state: RestoreState) {
        self.set_state(final_state);
        *lock(&self.cancel) = CancellationToken::new();
    }

    /// Restore the state captured by one backup in a single step. For an
    /// INCREMENTAL this is the state at the end of its chain.
    pub async fn restore_full(&self, backup_id: &str, safe_mode: bool) -> Result<RestoreReport> {
        let _guard = self.ctx.locks.try_acquire(OpKind::Restore)?;
        let started_at = Utc::now();
        let mode = if safe_mode {
            RestoreMode::Safe
        } else {
            RestoreMode::Destructive
        };

        self.set_state(RestoreState::Validating);
        let validated = self.validate_target(backup_id).await;
        let (chain, source, staged) = match validated {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(backup_id, error = %e, "Restore validation failed");
                self.finish(RestoreState::Failed);
                return Err(e);
            }
        };
        let Some(target) = staged.last() else {
            self.finish(RestoreState::Failed);
            return Err(RecoveryError::chain_broken(backup_id, "empty chain"));
        };

        match self.apply_one(target, safe_mode).await {
            Ok(written) => {
                self.finish(RestoreState::Complete);
                tracing::info!(
                    backup_id,
                    ?mode,
                    %source,
                    documents = written,
                    "Restore complete"
                );
                Ok(RestoreReport {
                    backup_id: backup_id.to_string(),
                    mode,
                    source,
                    final_state: RestoreState::Complete,
                    collections_restored: target.state.collection_count(),
                    documents_restored: written,
                    steps: vec![StepOutcome {
                        backup_id: target.record.backup_id.clone(),
                        backup_type: chain.target().backup_type,
                        status: StepStatus::Applied,
                        documents: written,
                        error: None,
                    }],
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(e) => {
                tracing::error!(backup_id, error = %e, "Restore failed, live data rolled back");
                self.finish(RestoreState::Failed);
                Err(e)
            }
        }
    }

    async fn validate_target(
        &self,
        backup_id: &str,
    ) -> Result<(Chain, MetadataSource, Vec<StagedLink>)> {
        let (chain, source) = load_chain(&self.ctx, backup_id).await?;
        let staged = materialize(&self.ctx, &chain).await?;
        Ok((chain, source, staged))
    }

    /// STAGING -> APPLYING -> VERIFYING for one staged state. When applying
    /// errors or verification fails, the pre-restore snapshot is swapped back
    /// in and the original error is returned.
    async fn apply_one(&self, link: &StagedLink, safe_mode: bool) -> Result<usize> {
        self.set_state(RestoreState::Staging);
        let shadow: Dataset = link.state.clone();
        let before = self.ctx.live.snapshot().await?;

        self.set_state(RestoreState::Applying);
        let applied = if safe_mode {
            self.ctx.live.merge(&shadow).await
        } else {
            let documents = shadow.document_count();
            self.ctx.live.swap(shadow.clone()).await.map(|()| documents)
        };
        let written = match applied {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!(
                    backup_id = %link.record.backup_id,
                    error = %e,
                    "Applying staged state failed, rolling back"
                );
                self.roll_back(link, before).await;
                return Err(e);
            }
        };

        self.set_state(RestoreState::Verifying);
        let after = self.ctx.live.snapshot().await?;
        let verified = if safe_mode {
            after.contains_all(&shadow)
        } else {
            after.checksum() == link.record.checksum
        };
        if verified {
            return Ok(written);
        }

        tracing::warn!(
            backup_id = %link.record.backup_id,
            "Post-restore verification failed, rolling back"
        );
        self.roll_back(link, before).await;
        Err(RecoveryError::ChecksumMismatch {
            backup_id: link.record.backup_id.clone(),
            step: "verifying".into(),
            expected: link.record.checksum.clone(),
            actual: after.checksum(),
        })
    }

    /// A failed rollback is logged; the caller reports the error that
    /// triggered it.
    async fn roll_back(&self, link: &StagedLink, before: Dataset) {
        let checkpoint = before.checksum();
        if let Err(e) = self.ctx.live.swap(before).await {
            tracing::error!(
                backup_id = %link.record.backup_id,
                checkpoint = %checkpoint,
                error = %e,
                "Rollback to the previous checkpoint failed, live data needs attention"
            );
        }
    }

    /// Restore `backup_id` by applying its chain link by link.
    pub async fn restore_chain(&self, backup_id: &str) -> Result<RestoreReport> {
        let guard = self.ctx.locks.try_acquire(OpKind::Restore)?;

        self.set_state(RestoreState::Validating);
        let (chain, source) = match load_chain(&self.ctx, backup_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(backup_id, error = %e, "Chain resolution failed");
                self.finish(RestoreState::Failed);
                return Err(e);
            }
        };

        let run = self.run_chain_with_guard(&guard, &chain, source).await;
        match run.error {
            Some(e) => Err(e),
            None => Ok(run.report),
        }
    }

    /// Apply an already-resolved chain. The caller holds the restore lock.
    pub(crate) async fn run_chain_with_guard(
        &self,
        guard: &LockGuard,
        chain: &Chain,
        source: MetadataSource,
    ) -> ChainRun {
        debug_assert_eq!(guard.kind(), OpKind::Restore);
        let started_at = Utc::now();
        let cancel = self.cancel_token();
        let target_id = chain.target().backup_id.clone();

        let mut report = RestoreReport {
            backup_id: target_id.clone(),
            mode: RestoreMode::Chain,
            source,
            final_state: RestoreState::Failed,
            collections_restored: 0,
            documents_restored: 0,
            steps: chain
                .links
                .iter()
                .map(|link| StepOutcome {
                    backup_id: link.backup_id.clone(),
                    backup_type: link.backup_type,
                    status: StepStatus::NotAttempted,
                    documents: 0,
                    error: None,
                })
                .collect(),
            started_at,
            finished_at: started_at,
        };

        self.set_state(RestoreState::Validating);
        let staged = match materialize(&self.ctx, chain).await {
            Ok(staged) => staged,
            Err(e) => return self.fail_chain(report, e),
        };

        // Resume after the newest checkpoint the live data already matches
        let live_checksum = match self.ctx.live.snapshot().await {
            Ok(live) => live.checksum(),
            Err(e) => return self.fail_chain(report, e),
        };
        let start = staged
            .iter()
            .rposition(|link| link.record.checksum == live_checksum)
            .map_or(0, |i| i + 1);
        for step in report.steps.iter_mut().take(start) {
            step.status = StepStatus::AlreadyApplied;
        }
        if start > 0 {
            tracing::info!(
                backup_id = %target_id,
                skipped = start,
                "Live data already at a chain checkpoint"
            );
        }

        for (i, link) in staged.iter().enumerate().skip(start) {
            if cancel.is_cancelled() {
                let err = RecoveryError::Cancelled {
                    backup_id: target_id.clone(),
                    applied: i,
                    total: staged.len(),
                };
                tracing::warn!(backup_id = %target_id, applied = i, "Chain restore cancelled");
                return self.fail_chain(report, err);
            }

            match self.apply_one(link, false).await {
                Ok(_) => {
                    report.steps[i].status = StepStatus::Applied;
                    report.steps[i].documents = link.documents;
                    tracing::info!(
                        backup_id = %link.record.backup_id,
                        link = i + 1,
                        links = staged.len(),
                        "Chain link applied"
                    );
                }
                Err(e) => {
                    report.steps[i].status = StepStatus::Failed;
                    report.steps[i].error = Some(e.to_string());
                    return self.fail_chain(report, e);
                }
            }
        }

        if let Some(last) = staged.last() {
            report.collections_restored = last.state.collection_count();
            report.documents_restored = last.state.document_count();
        }
        report.final_state = RestoreState::Complete;
        report.finished_at = Utc::now();
        self.finish(RestoreState::Complete);
        tracing::info!(
            backup_id = %target_id,
            %source,
            links = staged.len(),
            "Chain restore complete"
        );
        ChainRun {
            report,
            error: None,
        }
    }

    fn fail_chain(&self, mut report: RestoreReport, error: RecoveryError) -> ChainRun {
        tracing::error!(backup_id = %report.backup_id, error = %error, "Chain restore failed");
        report.final_state = RestoreState::Failed;
        report.finished_at = Utc::now();
        self.finish(RestoreState::Failed);
        ChainRun {
            report,
            error: Some(error),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
