//! Ledger-only recovery for when the primary metadata store is gone.

use super::chain::select_recovery_target;
use super::restore::{RestoreEngine, RestoreState, StepOutcome};
use super::EngineContext;
use crate::lock::OpKind;
use crate::models::{MetadataSource, RecordFilter};
use crate::retry::with_timeout;
use crate::utils::{RecoveryError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub chosen_backup_id: Option<String>,
    /// Link ids, FULL root first
    pub chain: Vec<String>,
    pub chain_length: usize,
    pub ledger_records_seen: usize,
    pub steps: Vec<StepOutcome>,
    pub final_state: RestoreState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct EmergencyRecoveryCoordinator {
    ctx: Arc<EngineContext>,
    restore: Arc<RestoreEngine>,
}

impl EmergencyRecoveryCoordinator {
    pub fn new(ctx: Arc<EngineContext>, restore: Arc<RestoreEngine>) -> Self {
        Self { ctx, restore }
    }

    /// Rebuild the candidate set from the ledger alone, pick the newest ACTIVE
    /// FULL with its longest chain and restore it. An exhausted ledger retry
    /// budget fails the whole call before anything is chosen.
    pub async fn emergency_recovery(&self) -> Result<RecoveryReport> {
        let settings = &self.ctx.settings;
        let started_at = Utc::now();

        let reachable = with_timeout(
            "primary.ping",
            settings.primary_timeout,
            self.ctx.primary.ping(),
        )
        .await;
        if reachable.is_ok() {
            return Err(RecoveryError::PrimaryReachable);
        }

        let guard = self.ctx.locks.try_acquire(OpKind::Restore)?;
        tracing::warn!("Primary store unreachable, starting ledger-driven recovery");

        let all = RecordFilter::default();
        let records = settings
            .retry
            .run_ledger("ledger.query_all", settings.op_timeout, || {
                self.ctx.ledger.query_all(&all)
            })
            .await?;

        let Some(chain) = select_recovery_target(&records) else {
            tracing::error!(
                ledger_records = records.len(),
                "No ACTIVE FULL backup in the ledger"
            );
            return Ok(RecoveryReport {
                chosen_backup_id: None,
                chain: Vec::new(),
                chain_length: 0,
                ledger_records_seen: records.len(),
                steps: Vec::new(),
                final_state: RestoreState::Failed,
                error: Some("no ACTIVE FULL backup in the ledger".into()),
                started_at,
                finished_at: Utc::now(),
            });
        };

        tracing::info!(
            root = %chain.root().backup_id,
            target = %chain.target().backup_id,
            links = chain.len(),
            "Recovery target selected"
        );

        let run = self
            .restore
            .run_chain_with_guard(&guard, &chain, MetadataSource::Ledger)
            .await;

        Ok(RecoveryReport {
            chosen_backup_id: Some(chain.target().backup_id.clone()),
            chain: chain.ids(),
            chain_length: chain.len(),
            ledger_records_seen: records.len(),
            steps: run.report.steps,
            final_state: run.report.final_state,
            error: run.error.map(|e| e.to_string()),
            started_at,
            finished_at: Utc::now(),
        })
    }
}
