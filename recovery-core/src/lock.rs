//! Backup and restore locks.
//!
//! The named locks share a single slot: holding any one excludes the others,
//! so no backup is created or deleted while a restore runs and vice versa.
//! Acquisition never waits.

use crate::utils::{RecoveryError, Result};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Backup,
    Restore,
    /// Deletion of backups, single or as a cleanup pass
    Retention,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Backup => write!(f, "backup"),
            OpKind::Restore => write!(f, "restore"),
            OpKind::Retention => write!(f, "retention"),
        }
    }
}

#[derive(Clone, Default)]
pub struct OperationLocks {
    held: Arc<Mutex<Option<OpKind>>>,
}

impl OperationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the named lock or fail immediately with `LockContention`.
    pub fn try_acquire(&self, kind: OpKind) -> Result<LockGuard> {
        let mut slot = lock_slot(&self.held);
        if let Some(held) = *slot {
            tracing::debug!(requested = %kind, %held, "Lock contention");
            return Err(RecoveryError::LockContention {
                requested: kind,
                held,
            });
        }
        *slot = Some(kind);
        Ok(LockGuard {
            held: self.held.clone(),
            kind,
        })
    }

    /// Operation currently holding the slot, if any.
    pub fn current(&self) -> Option<OpKind> {
        *lock_slot(&self.held)
    }
}

/// Releases the lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    held: Arc<Mutex<Option<OpKind>>>,
    kind: OpKind,
}

impl LockGuard {
    pub fn kind(&self) -> OpKind {
        self.kind
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut slot = lock_slot(&self.held);
        if *slot == Some(self.kind) {
            *slot = None;
        }
    }
}

fn lock_slot(slot: &Mutex<Option<OpKind>>) -> MutexGuard<'_, Option<OpKind>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ErrorKind;

    #[test]
    fn test_backup_and_restore_are_mutually_exclusive() {
        let locks = OperationLocks::new();
        let guard = locks.try_acquire(OpKind::Backup).unwrap();

        let err = locks.try_acquire(OpKind::Restore).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::LockContention);
        let err = locks.try_acquire(OpKind::Backup).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::LockContention);

        drop(guard);
        assert_eq!(locks.current(), None);

        let guard = locks.try_acquire(OpKind::Restore).unwrap();
        assert_eq!(guard.kind(), OpKind::Restore);
        assert_eq!(locks.current(), Some(OpKind::Restore));
    }

    #[test]
    fn test_retention_shares_the_slot() {
        let locks = OperationLocks::new();
        let guard = locks.try_acquire(OpKind::Retention).unwrap();
        match locks.try_acquire(OpKind::Restore) {
            Err(RecoveryError::LockContention { requested, held }) => {
                assert_eq!(requested, OpKind::Restore);
                assert_eq!(held, OpKind::Retention);
            }
            other => panic!("unexpected result: {:?}", other.map(|g| g.kind())),
        }
        drop(guard);
        assert!(locks.try_acquire(OpKind::Backup).is_ok());
    }

    #[test]
    fn test_clones_share_the_slot() {
        let locks = OperationLocks::new();
        let other = locks.clone();
        let _guard = locks.try_acquire(OpKind::Restore).unwrap();
        assert!(other.try_acquire(OpKind::Backup).is_err());
    }
}
