//! Cross-store verification. Detection only: nothing here writes.

use super::EngineContext;
use crate::models::BackupRecord;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchReason {
    MissingInPrimary,
    MissingInLedger,
    MissingInBoth,
    FieldsDiffer,
    /// A store could not be read, so the comparison is incomplete
    StoreUnavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub backup_id: String,
    #[serde(rename = "match")]
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<MismatchReason>,
    /// Compared fields that differ
    pub differing_fields: Vec<String>,
    pub primary_record: Option<BackupRecord>,
    pub ledger_record: Option<BackupRecord>,
    pub errors: Vec<String>,
}

/// Fields that must agree between the two copies of a record.
pub fn differing_fields(primary: &BackupRecord, ledger: &BackupRecord) -> Vec<String> {
    let mut fields = Vec::new();
    if primary.cid != ledger.cid {
        fields.push("cid".to_string());
    }
    if primary.backup_type != ledger.backup_type {
        fields.push("type".to_string());
    }
    if primary.status != ledger.status {
        fields.push("status".to_string());
    }
    fields
}

pub struct ReconciliationService {
    ctx: Arc<EngineContext>,
}

impl ReconciliationService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn verify(&self, backup_id: &str) -> VerifyReport {
        let (primary, ledger) =
            tokio::join!(self.ctx.primary_get(backup_id), self.ctx.ledger_get(backup_id));

        let mut errors = Vec::new();
        let primary_record = primary.unwrap_or_else(|e| {
            errors.push(format!("primary: {e}"));
            None
        });
        let ledger_record = ledger.unwrap_or_else(|e| {
            errors.push(format!("ledger: {e}"));
            None
        });

        let mut differing = Vec::new();
        let reason = match (&primary_record, &ledger_record) {
            _ if !errors.is_empty() => Some(MismatchReason::StoreUnavailable),
            (Some(p), Some(l)) => {
                differing = differing_fields(p, l);
                (!differing.is_empty()).then_some(MismatchReason::FieldsDiffer)
            }
            (Some(_), None) => Some(MismatchReason::MissingInLedger),
            (None, Some(_)) => Some(MismatchReason::MissingInPrimary),
            (None, None) => Some(MismatchReason::MissingInBoth),
        };

        let matched = reason.is_none();
        if matched {
            tracing::debug!(backup_id, "Reconciliation matched");
        } else {
            tracing::warn!(backup_id, ?reason, ?differing, "Reconciliation mismatch");
        }

        VerifyReport {
            backup_id: backup_id.to_string(),
            matched,
            reason,
            differing_fields: differing,
            primary_record,
            ledger_record,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackupStatus;
    use crate::store::PrimaryMetadataStore;
    use crate::testutil::Harness;

    #[tokio::test]
    async fn test_verify_matches_after_mirroring() {
        let h = Harness::new().await;
        let full = h.full_backup().await;

        let report = h.service.verify_backup(&full.backup_id).await;
        assert!(report.matched);
        assert!(report.reason.is_none());
        assert!(report.primary_record.is_some());
        assert!(report.ledger_record.is_some());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["match"], true);
    }

    #[tokio::test]
    async fn test_dropped_ledger_write_is_reported_with_both_sides() {
        let h = Harness::new().await;
        h.ledger.drop_writes_for_next();
        let full = h.full_backup().await;

        let report = h.service.verify_backup(&full.backup_id).await;
        assert!(!report.matched);
        assert_eq!(report.reason, Some(MismatchReason::MissingInLedger));
        let primary = report.primary_record.unwrap();
        assert_eq!(primary.backup_id, full.backup_id);
        assert!(report.ledger_record.is_none());
    }

    #[tokio::test]
    async fn test_status_drift_is_detected_without_writes() {
        let h = Harness::new().await;
        let full = h.full_backup().await;
        h.primary
            .inner()
            .update_status(&full.backup_id, BackupStatus::Failed)
            .await
            .unwrap();

        let report = h.service.verify_backup(&full.backup_id).await;
        assert_eq!(report.reason, Some(MismatchReason::FieldsDiffer));
        assert_eq!(report.differing_fields, vec!["status".to_string()]);

        let stored = h.primary.inner().get(&full.backup_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_backup_is_missing_in_both() {
        let h = Harness::new().await;
        let report = h.service.verify_backup("ghost").await;
        assert!(!report.matched);
        assert_eq!(report.reason, Some(MismatchReason::MissingInBoth));
    }
}
