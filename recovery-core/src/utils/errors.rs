//! Error taxonomy for backup, restore and recovery operations.

use crate::lock::OpKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Backup not found: {backup_id}")]
    NotFound { backup_id: String },

    #[error("Backup chain broken at {backup_id}: {reason}")]
    ChainBroken { backup_id: String, reason: String },

    #[error("Cannot start {requested}: {held} operation already in progress")]
    LockContention { requested: OpKind, held: OpKind },

    #[error("Ledger unavailable during {step} after {attempts} attempts: {cause}")]
    LedgerUnavailable {
        step: String,
        attempts: u32,
        cause: String,
    },

    #[error("Storage error during {step}: {cause}")]
    Storage { step: String, cause: String },

    #[error("Checksum mismatch for {backup_id} during {step}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        backup_id: String,
        step: String,
        expected: String,
        actual: String,
    },

    #[error("Backup {backup_id} has active dependents: {}", .dependents.join(", "))]
    DependentsActive {
        backup_id: String,
        dependents: Vec<String>,
    },

    #[error("Backup {backup_id} cannot be used: {reason}")]
    InvalidState { backup_id: String, reason: String },

    #[error("Primary metadata store is reachable; emergency recovery refused")]
    PrimaryReachable,

    #[error("Restore of {backup_id} cancelled after {applied} of {total} links")]
    Cancelled {
        backup_id: String,
        applied: usize,
        total: usize,
    },

    #[error("Ledger rejected {backup_id}: immutable fields differ from the mirrored entry")]
    LedgerConflict { backup_id: String },

    #[error("{step} timed out after {timeout_ms} ms")]
    Timeout { step: String, timeout_ms: u64 },

    #[error("Primary store error: {0}")]
    Primary(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Invalid backup record {backup_id}: {reason}")]
    InvalidRecord { backup_id: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable, fieldless tag for a [`RecoveryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    ChainBroken,
    LockContention,
    LedgerUnavailable,
    Storage,
    ChecksumMismatch,
    DependentsActive,
    InvalidState,
    Cancelled,
    Timeout,
    Internal,
}

impl RecoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecoveryError::NotFound { .. } => ErrorKind::NotFound,
            RecoveryError::ChainBroken { .. } => ErrorKind::ChainBroken,
            RecoveryError::LockContention { .. } => ErrorKind::LockContention,
            RecoveryError::LedgerUnavailable { .. } => ErrorKind::LedgerUnavailable,
            RecoveryError::Storage { .. } => ErrorKind::Storage,
            RecoveryError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            RecoveryError::DependentsActive { .. } => ErrorKind::DependentsActive,
            RecoveryError::InvalidState { .. } | RecoveryError::PrimaryReachable => {
                ErrorKind::InvalidState
            }
            RecoveryError::Cancelled { .. } => ErrorKind::Cancelled,
            RecoveryError::Timeout { .. } => ErrorKind::Timeout,
            RecoveryError::LedgerConflict { .. }
            | RecoveryError::Primary(_)
            | RecoveryError::Ledger(_)
            | RecoveryError::Payload(_)
            | RecoveryError::InvalidRecord { .. }
            | RecoveryError::Config(_)
            | RecoveryError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call may succeed. Integrity failures never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecoveryError::Timeout { .. }
                | RecoveryError::Storage { .. }
                | RecoveryError::Primary(_)
                | RecoveryError::Ledger(_)
                | RecoveryError::Io(_)
        )
    }

    pub fn not_found(backup_id: impl Into<String>) -> Self {
        RecoveryError::NotFound {
            backup_id: backup_id.into(),
        }
    }

    pub fn chain_broken(backup_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RecoveryError::ChainBroken {
            backup_id: backup_id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(backup_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RecoveryError::InvalidState {
            backup_id: backup_id.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(step: impl Into<String>, cause: impl ToString) -> Self {
        RecoveryError::Storage {
            step: step.into(),
            cause: cause.to_string(),
        }
    }

    /// Timeouts and I/O failures around the blob store surface as `Storage`.
    pub fn into_storage(self, step: &str) -> Self {
        match self {
            e @ (RecoveryError::Timeout { .. } | RecoveryError::Io(_)) => {
                RecoveryError::storage(step, e)
            }
            other => other,
        }
    }
}

impl From<rusqlite::Error> for RecoveryError {
    fn from(e: rusqlite::Error) -> Self {
        RecoveryError::Primary(e.to_string())
    }
}

impl From<r2d2::Error> for RecoveryError {
    fn from(e: r2d2::Error) -> Self {
        RecoveryError::Primary(e.to_string())
    }
}

impl From<serde_json::Error> for RecoveryError {
    fn from(e: serde_json::Error) -> Self {
        RecoveryError::Payload(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
