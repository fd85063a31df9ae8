//! Fetching and verifying payloads, and materializing chains into datasets.

use super::chain::Chain;
use super::EngineContext;
use crate::models::{BackupPayload, BackupRecord, Dataset};
use crate::store::cid_for;
use crate::utils::{RecoveryError, Result};

/// Dataset state after applying one chain link.
#[derive(Debug, Clone)]
pub struct StagedLink {
    pub record: BackupRecord,
    pub state: Dataset,
    /// Documents the link itself writes: the whole dataset for a FULL, the
    /// changed documents for an INCREMENTAL.
    pub documents: usize,
}

/// Fetch a record's payload and check that the bytes still hash to its CID.
pub async fn fetch_payload(ctx: &EngineContext, record: &BackupRecord) -> Result<BackupPayload> {
    let bytes = ctx
        .settings
        .retry
        .run("storage.get", ctx.settings.op_timeout, || {
            ctx.storage.get(&record.cid)
        })
        .await
        .map_err(|e| match e {
            RecoveryError::ChecksumMismatch {
                step,
                expected,
                actual,
                ..
            } => RecoveryError::ChecksumMismatch {
                backup_id: record.backup_id.clone(),
                step,
                expected,
                actual,
            },
            other => other.into_storage("storage.get"),
        })?;

    let actual = cid_for(&bytes);
    if actual != record.cid {
        return Err(RecoveryError::ChecksumMismatch {
            backup_id: record.backup_id.clone(),
            step: "validating".into(),
            expected: record.cid.clone(),
            actual,
        });
    }

    let payload = BackupPayload::decode(&bytes)?;
    if payload.backup_id() != record.backup_id {
        return Err(RecoveryError::Payload(format!(
            "payload {} belongs to {}, not {}",
            record.cid,
            payload.backup_id(),
            record.backup_id
        )));
    }
    Ok(payload)
}

/// Fetch every link and rebuild the state after each one, checking each
/// state against the link's recorded checksum. Any mismatch aborts before the
/// caller has touched live data.
pub async fn materialize(ctx: &EngineContext, chain: &Chain) -> Result<Vec<StagedLink>> {
    let mut staged: Vec<StagedLink> = Vec::with_capacity(chain.len());

    for link in &chain.links {
        let payload = fetch_payload(ctx, link).await?;
        let (state, documents) = match (payload, staged.last()) {
            (BackupPayload::Full { dataset, .. }, None) => {
                let documents = dataset.document_count();
                (dataset, documents)
            }
            (
                BackupPayload::Incremental {
                    parent_checksum,
                    diff,
                    ..
                },
                Some(prev),
            ) => {
                if parent_checksum != prev.record.checksum {
                    return Err(RecoveryError::ChecksumMismatch {
                        backup_id: link.backup_id.clone(),
                        step: "staging.parent".into(),
                        expected: prev.record.checksum.clone(),
                        actual: parent_checksum,
                    });
                }
                let mut state = prev.state.clone();
                state.apply(&diff);
                (state, diff.changed_documents())
            }
            (_, None) => {
                return Err(RecoveryError::chain_broken(
                    &link.backup_id,
                    "chain root payload is not a full snapshot",
                ))
            }
            (_, Some(_)) => {
                return Err(RecoveryError::chain_broken(
                    &link.backup_id,
                    "full snapshot payload in the middle of a chain",
                ))
            }
        };

        let actual = state.checksum();
        if actual != link.checksum {
            return Err(RecoveryError::ChecksumMismatch {
                backup_id: link.backup_id.clone(),
                step: "validating".into(),
                expected: link.checksum.clone(),
                actual,
            });
        }

        staged.push(StagedLink {
            record: link.clone(),
            state,
            documents,
        });
    }

    Ok(staged)
}
