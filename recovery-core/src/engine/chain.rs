//! Backup chain resolution.
//!
//! A chain is the ordered list FULL -> INCREMENTAL -> ... -> target. Resolution
//! is a pure function of a set of records so the same code serves the primary
//! store, the ledger and emergency target selection.

use super::EngineContext;
use crate::models::{BackupRecord, BackupStatus, MetadataSource};
use crate::utils::{RecoveryError, Result};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct RecordIndex {
    by_id: HashMap<String, BackupRecord>,
}

impl RecordIndex {
    pub fn new(records: impl IntoIterator<Item = BackupRecord>) -> Self {
        let mut index = Self::default();
        for record in records {
            index.insert(record);
        }
        index
    }

    pub fn insert(&mut self, record: BackupRecord) {
        self.by_id.insert(record.backup_id.clone(), record);
    }

    pub fn get(&self, backup_id: &str) -> Option<&BackupRecord> {
        self.by_id.get(backup_id)
    }

    pub fn contains(&self, backup_id: &str) -> bool {
        self.by_id.contains_key(backup_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &BackupRecord> {
        self.by_id.values()
    }

    /// ACTIVE children of `parent_id` that could extend a chain, ordered by
    /// creation time then id.
    pub fn active_children(&self, parent_id: &str) -> Vec<&BackupRecord> {
        let Some(parent) = self.get(parent_id) else {
            return Vec::new();
        };
        let mut children: Vec<&BackupRecord> = self
            .by_id
            .values()
            .filter(|r| r.parent_backup_id.as_deref() == Some(parent_id))
            .filter(|r| r.is_active() && r.validate().is_ok())
            .filter(|r| r.created_at >= parent.created_at)
            .collect();
        children.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        children
    }
}

/// Links in application order; the first link is always the FULL root.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub links: Vec<BackupRecord>,
}

impl Chain {
    pub fn root(&self) -> &BackupRecord {
        &self.links[0]
    }

    pub fn target(&self) -> &BackupRecord {
        &self.links[self.links.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Number of INCREMENTAL links under the root.
    pub fn incrementals(&self) -> usize {
        self.links.len().saturating_sub(1)
    }

    pub fn ids(&self) -> Vec<String> {
        self.links.iter().map(|l| l.backup_id.clone()).collect()
    }
}

/// Walk `target_id` root-ward and check contiguity. Nothing is touched on
/// failure, so callers can resolve before any data moves.
pub fn resolve(index: &RecordIndex, target_id: &str) -> Result<Chain> {
    let target = index
        .get(target_id)
        .ok_or_else(|| RecoveryError::not_found(target_id))?;
    if target.status != BackupStatus::Active {
        return Err(RecoveryError::invalid_state(
            target_id,
            format!("status is {}", target.status),
        ));
    }

    let mut links = vec![target.clone()];
    let mut seen = HashSet::from([target_id.to_string()]);
    let mut current = target;

    while let Some(parent_id) = current.parent_backup_id.as_deref() {
        if let Err(e) = current.validate() {
            return Err(RecoveryError::chain_broken(&current.backup_id, e.to_string()));
        }
        if !seen.insert(parent_id.to_string()) {
            return Err(RecoveryError::chain_broken(
                &current.backup_id,
                format!("cycle through {parent_id}"),
            ));
        }
        let parent = index.get(parent_id).ok_or_else(|| {
            RecoveryError::chain_broken(
                &current.backup_id,
                format!("parent {parent_id} is missing"),
            )
        })?;
        if parent.status != BackupStatus::Active {
            return Err(RecoveryError::chain_broken(
                &current.backup_id,
                format!("ancestor {parent_id} is {}", parent.status),
            ));
        }
        if parent.created_at > current.created_at {
            return Err(RecoveryError::chain_broken(
                &current.backup_id,
                format!("parent {parent_id} is newer than its child"),
            ));
        }
        links.push(parent.clone());
        current = parent;
    }

    if !current.is_full() {
        return Err(RecoveryError::chain_broken(
            &current.backup_id,
            "chain root is not a FULL backup",
        ));
    }

    links.reverse();
    Ok(Chain { links })
}

/// Longest run of ACTIVE incrementals hanging off `full_id`. Ties go to the
/// branch whose tail is newest, then to the smallest tail id.
pub fn longest_chain_from(index: &RecordIndex, full_id: &str) -> Option<Chain> {
    let root = index.get(full_id)?;
    if !root.is_full() || !root.is_active() {
        return None;
    }

    fn walk<'a>(
        index: &'a RecordIndex,
        node: &'a BackupRecord,
        visiting: &mut HashSet<String>,
    ) -> Vec<&'a BackupRecord> {
        let mut best: Vec<&BackupRecord> = Vec::new();
        for child in index.active_children(&node.backup_id) {
            if !visiting.insert(child.backup_id.clone()) {
                continue;
            }
            let candidate = walk(index, child, visiting);
            visiting.remove(&child.backup_id);
            if better_branch(&candidate, &best) {
                best = candidate;
            }
        }
        let mut path = vec![node];
        path.extend(best);
        path
    }

    let mut visiting = HashSet::from([full_id.to_string()]);
    let links = walk(index, root, &mut visiting)
        .into_iter()
        .cloned()
        .collect();
    Some(Chain { links })
}

fn better_branch(candidate: &[&BackupRecord], best: &[&BackupRecord]) -> bool {
    if candidate.len() != best.len() {
        return candidate.len() > best.len();
    }
    match (candidate.last(), best.last()) {
        (Some(c), Some(b)) => (c.created_at, std::cmp::Reverse(&c.backup_id))
            > (b.created_at, std::cmp::Reverse(&b.backup_id)),
        (Some(_), None) => true,
        _ => false,
    }
}

/// Most recent ACTIVE FULL by `(created_at, backup_id)` with its longest
/// chain. Depends only on the records given, so an unchanged ledger always
/// yields the same target.
pub fn select_recovery_target(records: &[BackupRecord]) -> Option<Chain> {
    let index = RecordIndex::new(records.iter().cloned());
    let root = records
        .iter()
        .filter(|r| r.is_full() && r.is_active() && r.validate().is_ok())
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        })?;
    longest_chain_from(&index, &root.backup_id)
}

/// Fetch `target_id` and its ancestors, then resolve. Ancestors come from the
/// same store that answered for the target.
pub async fn load_chain(
    ctx: &EngineContext,
    target_id: &str,
) -> Result<(Chain, MetadataSource)> {
    let (target, source) = ctx.lookup_record(target_id).await?;
    let mut index = RecordIndex::default();
    let mut next = target.parent_backup_id.clone();
    index.insert(target);

    while let Some(parent_id) = next.take() {
        if index.contains(&parent_id) {
            break;
        }
        let parent = match source {
            MetadataSource::Primary => ctx.primary_get(&parent_id).await?,
            MetadataSource::Ledger => ctx.ledger_get(&parent_id).await?,
        };
        match parent {
            Some(parent) => {
                next = parent.parent_backup_id.clone();
                index.insert(parent);
            }
            None => break,
        }
    }

    let chain = resolve(&index, target_id)?;
    tracing::debug!(
        backup_id = target_id,
        %source,
        links = chain.len(),
        "Chain resolved"
    );
    Ok((chain, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackupType;
    use crate::utils::ErrorKind;
    use chrono::{Duration, TimeZone, Utc};

    fn rec(id: &str, parent: Option<&str>, minute: i64) -> BackupRecord {
        BackupRecord {
            backup_id: id.to_string(),
            backup_type: if parent.is_some() {
                BackupType::Incremental
            } else {
                BackupType::Full
            },
            status: BackupStatus::Active,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minute),
            triggered_by: "admin-1".into(),
            cid: format!("sha256-{id}"),
            checksum: format!("sum-{id}"),
            size_bytes: 1,
            parent_backup_id: parent.map(str::to_string),
            ledger_tx_id: None,
        }
    }

    #[test]
    fn test_resolve_orders_root_first() {
        let index = RecordIndex::new(vec![
            rec("f1", None, 0),
            rec("i1", Some("f1"), 1),
            rec("i2", Some("i1"), 2),
        ]);
        let chain = resolve(&index, "i2").unwrap();
        assert_eq!(chain.ids(), vec!["f1", "i1", "i2"]);
        assert_eq!(chain.incrementals(), 2);
        assert_eq!(chain.root().backup_id, "f1");
    }

    #[test]
    fn test_resolve_rejects_missing_parent_and_cycles() {
        let index = RecordIndex::new(vec![rec("i1", Some("f1"), 1)]);
        let err = resolve(&index, "i1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainBroken);

        let index = RecordIndex::new(vec![rec("a", Some("b"), 1), rec("b", Some("a"), 1)]);
        let err = resolve(&index, "a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainBroken);
        assert!(err.to_string().contains("cycle"));

        let err = resolve(&index, "zzz").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_resolve_rejects_deleted_ancestor() {
        let mut full = rec("f1", None, 0);
        full.status = BackupStatus::Deleted;
        let index = RecordIndex::new(vec![full, rec("i1", Some("f1"), 1)]);
        let err = resolve(&index, "i1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainBroken);

        let mut target = rec("f2", None, 0);
        target.status = BackupStatus::Failed;
        let index = RecordIndex::new(vec![target]);
        assert_eq!(
            resolve(&index, "f2").unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_longest_chain_prefers_depth_then_newest_tail() {
        let index = RecordIndex::new(vec![
            rec("f1", None, 0),
            rec("a1", Some("f1"), 1),
            rec("a2", Some("a1"), 2),
            rec("b1", Some("f1"), 3),
            rec("b2", Some("b1"), 4),
            rec("c1", Some("f1"), 5),
        ]);
        let chain = longest_chain_from(&index, "f1").unwrap();
        assert_eq!(chain.ids(), vec!["f1", "b1", "b2"]);
    }

    #[test]
    fn test_recovery_target_is_deterministic() {
        let mut old_full = rec("f0", None, 0);
        old_full.created_at -= Duration::days(1);
        let mut deleted = rec("f9", None, 50);
        deleted.status = BackupStatus::Deleted;
        let records = vec![
            old_full,
            rec("f1", None, 10),
            rec("i1", Some("f1"), 11),
            deleted,
        ];

        let first = select_recovery_target(&records).unwrap();
        let mut shuffled = records.clone();
        shuffled.reverse();
        let second = select_recovery_target(&shuffled).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.ids(), vec!["f1", "i1"]);

        assert!(select_recovery_target(&[rec("i1", Some("f1"), 1)]).is_none());
    }
}
