use crate::utils::{RecoveryError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    Active,
    Deleted,
    Failed,
    LedgerPending,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "FULL",
            BackupType::Incremental => "INCREMENTAL",
        }
    }
}

impl FromStr for BackupType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupType::Full),
            "INCREMENTAL" => Ok(BackupType::Incremental),
            _ => Err(ParseEnumError {
                kind: "backup type",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Active => "ACTIVE",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Failed => "FAILED",
            BackupStatus::LedgerPending => "LEDGER_PENDING",
        }
    }
}

impl FromStr for BackupStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(BackupStatus::Active),
            "DELETED" => Ok(BackupStatus::Deleted),
            "FAILED" => Ok(BackupStatus::Failed),
            "LEDGER_PENDING" => Ok(BackupStatus::LedgerPending),
            _ => Err(ParseEnumError {
                kind: "backup status",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one backup, stored identically in the primary store and the
/// ledger. `(backup_id, cid, checksum)` never changes once mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub triggered_by: String,
    pub cid: String,
    /// SHA-256 of the full dataset state this backup restores to
    pub checksum: String,
    pub size_bytes: u64,
    pub parent_backup_id: Option<String>,
    pub ledger_tx_id: Option<String>,
}

impl BackupRecord {
    pub fn is_full(&self) -> bool {
        self.backup_type == BackupType::Full
    }

    pub fn is_active(&self) -> bool {
        self.status == BackupStatus::Active
    }

    /// FULL records have no parent; INCREMENTAL records require one.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| RecoveryError::InvalidRecord {
            backup_id: self.backup_id.clone(),
            reason: reason.to_string(),
        };
        if self.backup_id.is_empty() {
            return Err(invalid("backup_id is empty"));
        }
        if self.cid.is_empty() || self.checksum.is_empty() {
            return Err(invalid("cid and checksum are required"));
        }
        match (self.backup_type, self.parent_backup_id.as_deref()) {
            (BackupType::Full, Some(_)) => Err(invalid("FULL backup must not have a parent")),
            (BackupType::Incremental, None) => {
                Err(invalid("INCREMENTAL backup requires parent_backup_id"))
            }
            (BackupType::Incremental, Some(p)) if p == self.backup_id => {
                Err(invalid("INCREMENTAL backup cannot be its own parent"))
            }
            _ => Ok(()),
        }
    }

    /// Whether the immutable tuple matches another copy of the same backup.
    pub fn same_identity(&self, other: &BackupRecord) -> bool {
        self.backup_id == other.backup_id
            && self.cid == other.cid
            && self.checksum == other.checksum
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Which store answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataSource {
    Primary,
    Ledger,
}

impl fmt::Display for MetadataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataSource::Primary => f.write_str("primary"),
            MetadataSource::Ledger => f.write_str("ledger"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub status: Option<BackupStatus>,
    #[serde(default, rename = "type")]
    pub backup_type: Option<BackupType>,
    #[serde(default)]
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub parent_backup_id: Option<String>,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn with_status(status: BackupStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn children_of(parent_id: &str) -> Self {
        Self {
            parent_backup_id: Some(parent_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self.backup_type.map_or(true, |t| record.backup_type == t)
            && self
                .triggered_by
                .as_deref()
                .map_or(true, |t| record.triggered_by == t)
            && self
                .parent_backup_id
                .as_deref()
                .map_or(true, |p| record.parent_backup_id.as_deref() == Some(p))
            && self.cid.as_deref().map_or(true, |c| record.cid == c)
            && self.created_before.map_or(true, |t| record.created_at < t)
    }
}

/// Newest first, ties broken by id, duplicates dropped, then filtered and
/// truncated. Both read paths return records in this shape.
pub fn normalize_records(
    mut records: Vec<BackupRecord>,
    filter: &RecordFilter,
    limit: Option<usize>,
) -> Vec<BackupRecord> {
    records.retain(|r| filter.matches(r));
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.backup_id.cmp(&b.backup_id))
    });
    records.dedup_by(|a, b| a.backup_id == b.backup_id);
    if let Some(limit) = limit {
        records.truncate(limit);
    }
    records
}
