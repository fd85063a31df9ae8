//! Recovery core - backup metadata kept in a primary store and mirrored to an
//! append-only ledger, with chained restores and ledger-only disaster recovery.
//!
//! This crate provides:
//! - FULL and INCREMENTAL backups over a pluggable live dataset
//! - Primary-first reads that fall back to the ledger
//! - Cross-store reconciliation
//! - Checkpointed chain restores with rollback and cancellation
//! - Emergency recovery driven by ledger records alone
//! - Dependency-aware retention

pub mod config;
pub mod engine;
pub mod live;
pub mod lock;
pub mod models;
pub mod retry;
pub mod service;
pub mod store;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{Config, EngineSettings};
pub use engine::retention::RetentionPolicy;
pub use live::{LiveData, MemoryLiveData};
pub use lock::OpKind;
pub use service::{Dependencies, RecoveryService};
pub use utils::{ErrorKind, RecoveryError, Result};
