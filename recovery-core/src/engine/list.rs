//! Dual-path reads: primary store first, ledger on timeout or error.

use super::EngineContext;
use crate::models::{normalize_records, BackupRecord, MetadataSource, RecordFilter};
use crate::retry::with_timeout;
use crate::utils::Result;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub source: MetadataSource,
    pub records: Vec<BackupRecord>,
    /// Why the primary was bypassed, when it was
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

pub struct ListQueryService {
    ctx: Arc<EngineContext>,
}

impl ListQueryService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Never fails: when both stores are down the result is empty and
    /// `fallback_reason` says why. Records are never mixed across sources.
    pub async fn list(&self, filter: &RecordFilter, limit: Option<usize>) -> ListResult {
        let settings = &self.ctx.settings;

        let primary_err = match with_timeout(
            "primary.query",
            settings.primary_timeout,
            self.ctx.primary.query(filter, limit),
        )
        .await
        {
            Ok(records) => {
                return ListResult {
                    source: MetadataSource::Primary,
                    records: normalize_records(records, filter, limit),
                    fallback_reason: None,
                }
            }
            Err(e) => e,
        };

        tracing::warn!(error = %primary_err, "Primary query failed, falling back to ledger");

        match settings
            .retry
            .run_ledger("ledger.query_all", settings.op_timeout, || {
                self.ctx.ledger.query_all(filter)
            })
            .await
        {
            Ok(records) => ListResult {
                source: MetadataSource::Ledger,
                records: normalize_records(records, filter, limit),
                fallback_reason: Some(primary_err.to_string()),
            },
            Err(ledger_err) => {
                tracing::error!(
                    primary_error = %primary_err,
                    ledger_error = %ledger_err,
                    "Both metadata stores unavailable"
                );
                ListResult {
                    source: MetadataSource::Ledger,
                    records: Vec::new(),
                    fallback_reason: Some(format!(
                        "primary: {primary_err}; ledger: {ledger_err}"
                    )),
                }
            }
        }
    }

    /// Single record from whichever store has it.
    pub async fn get(&self, backup_id: &str) -> Result<(BackupRecord, MetadataSource)> {
        self.ctx.lookup_record(backup_id).await
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{BackupStatus, MetadataSource, RecordFilter};
    use crate::testutil::Harness;
    use crate::utils::ErrorKind;

    #[tokio::test]
    async fn test_list_reads_primary_when_healthy() {
        let h = Harness::new().await;
        let full = h.full_backup().await;

        let result = h.service.list_backups(&RecordFilter::default(), None).await;
        assert_eq!(result.source, MetadataSource::Primary);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].backup_id, full.backup_id);
        assert!(result.fallback_reason.is_none());
    }

    #[tokio::test]
    async fn test_list_falls_back_to_ledger_on_outage() {
        let h = Harness::new().await;
        let full = h.full_backup().await;
        let from_primary = h.service.list_backups(&RecordFilter::default(), None).await;

        h.primary.set_down(true);
        let result = h.service.list_backups(&RecordFilter::default(), None).await;
        assert_eq!(result.source, MetadataSource::Ledger);
        assert_eq!(result.records, from_primary.records);
        assert_eq!(result.records[0].backup_id, full.backup_id);
        assert!(result.fallback_reason.is_some());
    }

    #[tokio::test]
    async fn test_slow_primary_is_bounded_by_timeout() {
        let h = Harness::new().await;
        h.full_backup().await;
        h.primary.set_stalled(true);

        let started = std::time::Instant::now();
        let result = h.service.list_backups(&RecordFilter::default(), Some(5)).await;
        assert_eq!(result.source, MetadataSource::Ledger);
        assert_eq!(result.records.len(), 1);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_list_degrades_to_empty_when_both_stores_fail() {
        let h = Harness::new().await;
        h.full_backup().await;
        h.primary.set_down(true);
        h.ledger.set_down(true);

        let result = h.service.list_backups(&RecordFilter::default(), None).await;
        assert!(result.records.is_empty());
        let reason = result.fallback_reason.unwrap();
        assert!(reason.contains("primary"));
        assert!(reason.contains("ledger"));
    }

    #[tokio::test]
    async fn test_list_applies_filter_and_limit() {
        let h = Harness::new().await;
        h.full_backup().await;
        h.full_backup().await;
        h.full_backup().await;

        let result = h
            .service
            .list_backups(&RecordFilter::with_status(BackupStatus::Active), Some(2))
            .await;
        assert_eq!(result.records.len(), 2);
        assert!(result.records[0].created_at >= result.records[1].created_at);
    }

    #[tokio::test]
    async fn test_get_falls_back_and_reports_missing() {
        let h = Harness::new().await;
        let full = h.full_backup().await;

        h.primary.set_down(true);
        let (record, source) = h.service.get_backup(&full.backup_id).await.unwrap();
        assert_eq!(source, MetadataSource::Ledger);
        assert_eq!(record.cid, full.cid);

        h.primary.set_down(false);
        let err = h.service.get_backup("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
