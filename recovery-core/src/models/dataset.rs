//! Snapshot data model and the payload format stored per backup.
//!
//! A dataset maps collection name to documents keyed by primary key. The
//! checksum is SHA-256 over its canonical JSON: collections and documents are
//! `BTreeMap`s and `serde_json` objects keep sorted keys, so equal datasets
//! always hash equally.

use crate::utils::{RecoveryError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub type Document = serde_json::Value;
pub type Collection = BTreeMap<String, Document>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataset {
    pub collections: BTreeMap<String, Collection>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collection: &str, id: &str, doc: Document) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<&Document> {
        self.collections.get(collection).and_then(|c| c.get(id))
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub fn document_count(&self) -> usize {
        self.collections.values().map(|c| c.len()).sum()
    }

    pub fn checksum(&self) -> String {
        // Serializing string-keyed maps of JSON values cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex_digest(&bytes)
    }

    /// Changes that turn `base` into `self`.
    pub fn diff_from(&self, base: &Dataset) -> DatasetDiff {
        let mut diff = DatasetDiff::default();

        for (name, docs) in &self.collections {
            match base.collections.get(name) {
                None => {
                    diff.upserts.insert(name.clone(), docs.clone());
                }
                Some(base_docs) => {
                    let changed: Collection = docs
                        .iter()
                        .filter(|(id, doc)| base_docs.get(*id) != Some(*doc))
                        .map(|(id, doc)| (id.clone(), doc.clone()))
                        .collect();
                    if !changed.is_empty() {
                        diff.upserts.insert(name.clone(), changed);
                    }
                    let removed: Vec<String> = base_docs
                        .keys()
                        .filter(|id| !docs.contains_key(*id))
                        .cloned()
                        .collect();
                    if !removed.is_empty() {
                        diff.deletes.insert(name.clone(), removed);
                    }
                }
            }
        }

        diff.dropped_collections = base
            .collections
            .keys()
            .filter(|name| !self.collections.contains_key(*name))
            .cloned()
            .collect();

        diff
    }

    pub fn apply(&mut self, diff: &DatasetDiff) {
        for name in &diff.dropped_collections {
            self.collections.remove(name);
        }
        for (name, ids) in &diff.deletes {
            if let Some(docs) = self.collections.get_mut(name) {
                for id in ids {
                    docs.remove(id);
                }
            }
        }
        for (name, docs) in &diff.upserts {
            let target = self.collections.entry(name.clone()).or_default();
            for (id, doc) in docs {
                target.insert(id.clone(), doc.clone());
            }
        }
    }

    /// Upsert every staged document by key; documents absent from `staged`
    /// are left untouched. Returns the number of documents written.
    pub fn merge(&mut self, staged: &Dataset) -> usize {
        let mut written = 0;
        for (name, docs) in &staged.collections {
            let target = self.collections.entry(name.clone()).or_default();
            for (id, doc) in docs {
                target.insert(id.clone(), doc.clone());
                written += 1;
            }
        }
        written
    }

    /// Whether every staged document is present here with identical content.
    pub fn contains_all(&self, staged: &Dataset) -> bool {
        staged.collections.iter().all(|(name, docs)| {
            self.collections.get(name).is_some_and(|live| {
                docs.iter().all(|(id, doc)| live.get(id) == Some(doc))
            })
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetDiff {
    #[serde(default)]
    pub upserts: BTreeMap<String, Collection>,
    #[serde(default)]
    pub deletes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub dropped_collections: Vec<String>,
}

impl DatasetDiff {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty() && self.dropped_collections.is_empty()
    }

    pub fn changed_documents(&self) -> usize {
        self.upserts.values().map(|c| c.len()).sum::<usize>()
            + self.deletes.values().map(|d| d.len()).sum::<usize>()
    }
}

/// Bytes handed to the storage adapter for one backup. The owning id is part
/// of the payload, so every backup gets its own CID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupPayload {
    Full {
        backup_id: String,
        dataset: Dataset,
    },
    Incremental {
        backup_id: String,
        /// Checksum of the state the diff applies to
        parent_checksum: String,
        diff: DatasetDiff,
    },
}

impl BackupPayload {
    pub fn backup_id(&self) -> &str {
        match self {
            BackupPayload::Full { backup_id, .. } | BackupPayload::Incremental { backup_id, .. } => {
                backup_id
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| RecoveryError::Payload(format!("undecodable backup payload: {e}")))
    }
}

pub fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
