//! Append-only ledger mirror.
//!
//! Entries are kept in memory and, when a journal path is given, appended as
//! JSON lines that are replayed on open. Each transaction id is the SHA-256 of
//! the previous id and the entry body, so rewriting any past entry breaks
//! every later id and is caught on replay.

use super::LedgerMirror;
use crate::models::dataset::hex_digest;
use crate::models::{
    normalize_records, BackupRecord, BackupStatus, LedgerStats, RecordFilter,
};
use crate::utils::{RecoveryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const GENESIS: &str = "genesis";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum EntryBody {
    Submit {
        record: BackupRecord,
    },
    Status {
        backup_id: String,
        status: BackupStatus,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    tx_id: String,
    prev_tx_id: String,
    at: DateTime<Utc>,
    #[serde(flatten)]
    body: EntryBody,
}

fn chain_tx_id(prev_tx_id: &str, at: &DateTime<Utc>, body: &EntryBody) -> Result<String> {
    let mut material = Vec::new();
    material.extend_from_slice(prev_tx_id.as_bytes());
    material.extend_from_slice(at.to_rfc3339().as_bytes());
    material.extend_from_slice(&serde_json::to_vec(body)?);
    Ok(format!("tx-{}", &hex_digest(&material)[..32]))
}

/// Folded view of one backup: its submission plus the latest status.
struct BackupView {
    record: BackupRecord,
    status: BackupStatus,
    status_tx_id: Option<String>,
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    views: HashMap<String, BackupView>,
}

impl LedgerState {
    fn last_tx_id(&self) -> &str {
        self.entries
            .last()
            .map(|e| e.tx_id.as_str())
            .unwrap_or(GENESIS)
    }

    fn fold(&mut self, entry: &LedgerEntry) -> Result<()> {
        match &entry.body {
            EntryBody::Submit { record } => {
                let mut record = record.clone();
                record.ledger_tx_id = Some(entry.tx_id.clone());
                self.views.insert(
                    record.backup_id.clone(),
                    BackupView {
                        status: record.status,
                        record,
                        status_tx_id: None,
                    },
                );
            }
            EntryBody::Status { backup_id, status } => {
                let view = self.views.get_mut(backup_id).ok_or_else(|| {
                    RecoveryError::Ledger(format!(
                        "status entry {} references unknown backup {backup_id}",
                        entry.tx_id
                    ))
                })?;
                view.status = *status;
                view.status_tx_id = Some(entry.tx_id.clone());
            }
        }
        Ok(())
    }

    fn current(&self, backup_id: &str) -> Option<BackupRecord> {
        self.views.get(backup_id).map(|v| {
            let mut record = v.record.clone();
            record.status = v.status;
            record
        })
    }
}

pub struct JournalLedger {
    state: Mutex<LedgerState>,
    journal: Option<PathBuf>,
}

impl JournalLedger {
    /// Ledger without a journal; contents live as long as the value.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            journal: None,
        }
    }

    /// Open (or create) a journaled ledger, replaying and verifying it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = LedgerState::default();

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let entry: LedgerEntry = serde_json::from_str(line).map_err(|e| {
                        RecoveryError::Ledger(format!("journal line {}: {e}", line_no + 1))
                    })?;
                    let expected = chain_tx_id(state.last_tx_id(), &entry.at, &entry.body)?;
                    if entry.prev_tx_id != state.last_tx_id() || entry.tx_id != expected {
                        return Err(RecoveryError::Ledger(format!(
                            "journal line {} fails hash-chain verification",
                            line_no + 1
                        )));
                    }
                    state.fold(&entry)?;
                    state.entries.push(entry);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            path = %path.display(),
            entries = state.entries.len(),
            backups = state.views.len(),
            "Ledger journal replayed"
        );

        Ok(Self {
            state: Mutex::new(state),
            journal: Some(path),
        })
    }

    async fn append(&self, state: &mut LedgerState, body: EntryBody) -> Result<String> {
        let at = Utc::now();
        let prev_tx_id = state.last_tx_id().to_string();
        let tx_id = chain_tx_id(&prev_tx_id, &at, &body)?;
        let entry = LedgerEntry {
            tx_id: tx_id.clone(),
            prev_tx_id,
            at,
            body,
        };

        if let Some(path) = &self.journal {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| RecoveryError::Ledger(format!("journal open: {e}")))?;
            file.write_all(&line)
                .await
                .map_err(|e| RecoveryError::Ledger(format!("journal append: {e}")))?;
            file.sync_data()
                .await
                .map_err(|e| RecoveryError::Ledger(format!("journal sync: {e}")))?;
        }

        state.fold(&entry)?;
        state.entries.push(entry);
        Ok(tx_id)
    }
}

#[async_trait]
impl LedgerMirror for JournalLedger {
    async fn submit(&self, record: &BackupRecord) -> Result<String> {
        record.validate()?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.views.get(&record.backup_id) {
            if !existing.record.same_identity(record) {
                return Err(RecoveryError::LedgerConflict {
                    backup_id: record.backup_id.clone(),
                });
            }
            let tx_id = existing.record.ledger_tx_id.clone().unwrap_or_default();
            tracing::debug!(backup_id = %record.backup_id, %tx_id, "Ledger submit is a replay");
            return Ok(tx_id);
        }

        let mut stored = record.clone();
        stored.ledger_tx_id = None;
        let tx_id = self
            .append(&mut state, EntryBody::Submit { record: stored })
            .await?;
        tracing::info!(backup_id = %record.backup_id, %tx_id, "Backup mirrored to ledger");
        Ok(tx_id)
    }

    async fn record_status(&self, backup_id: &str, status: BackupStatus) -> Result<String> {
        let mut state = self.state.lock().await;
        let view = state
            .views
            .get(backup_id)
            .ok_or_else(|| RecoveryError::not_found(backup_id))?;

        if view.status == status {
            let tx_id = view
                .status_tx_id
                .clone()
                .or_else(|| view.record.ledger_tx_id.clone())
                .unwrap_or_default();
            return Ok(tx_id);
        }

        let tx_id = self
            .append(
                &mut state,
                EntryBody::Status {
                    backup_id: backup_id.to_string(),
                    status,
                },
            )
            .await?;
        tracing::info!(%backup_id, %status, %tx_id, "Ledger status change recorded");
        Ok(tx_id)
    }

    async fn query_all(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>> {
        let state = self.state.lock().await;
        let records = state
            .views
            .keys()
            .filter_map(|id| state.current(id))
            .collect();
        Ok(normalize_records(records, filter, None))
    }

    async fn query_by_id(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        Ok(self.state.lock().await.current(backup_id))
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let state = self.state.lock().await;
        let mut stats = LedgerStats {
            entries: state.entries.len() as u64,
            backups: state.views.len() as u64,
            last_tx_id: state.entries.last().map(|e| e.tx_id.clone()),
            ..Default::default()
        };
        for view in state.views.values() {
            *stats
                .by_status
                .entry(view.status.to_string())
                .or_default() += 1;
            *stats
                .by_type
                .entry(view.record.backup_type.to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }
}
