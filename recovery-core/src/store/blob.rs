//! Content-addressed payload storage.
//!
//! CID = `sha256-<hex>` of the uncompressed payload. On disk, blobs are zstd
//! compressed and sharded by the first two hex characters:
//!
//! ```text
//! <root>/ab/ab12...ef.zst
//! ```

use super::StorageAdapter;
use crate::models::dataset::hex_digest;
use crate::models::BlobStats;
use crate::utils::{RecoveryError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

const CID_PREFIX: &str = "sha256-";

pub fn cid_for(payload: &[u8]) -> String {
    format!("{CID_PREFIX}{}", hex_digest(payload))
}

fn digest_part(cid: &str) -> Result<&str> {
    let hex = cid
        .strip_prefix(CID_PREFIX)
        .ok_or_else(|| RecoveryError::storage("blob.resolve", format!("malformed cid {cid}")))?;
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(RecoveryError::storage(
            "blob.resolve",
            format!("malformed cid {cid}"),
        ));
    }
    Ok(hex)
}

pub struct FsBlobStore {
    root: PathBuf,
    compression_level: i32,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>, compression_level: i32) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            compression_level,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, cid: &str) -> Result<PathBuf> {
        let hex = digest_part(cid)?;
        Ok(self.root.join(&hex[..2]).join(format!("{hex}.zst")))
    }
}

#[async_trait]
impl StorageAdapter for FsBlobStore {
    async fn put(&self, payload: Bytes) -> Result<String> {
        let cid = cid_for(&payload);
        let path = self.path_for(&cid)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(cid);
        }

        let level = self.compression_level;
        let compressed = tokio::task::spawn_blocking(move || zstd::encode_all(&payload[..], level))
            .await
            .map_err(|e| RecoveryError::storage("blob.put", e))?
            .map_err(|e| RecoveryError::storage("blob.put", e))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RecoveryError::storage("blob.put", e))?;
        }
        // Write-then-rename so a crash never leaves a truncated blob under its cid
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &compressed)
            .await
            .map_err(|e| RecoveryError::storage("blob.put", e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RecoveryError::storage("blob.put", e))?;

        tracing::debug!(%cid, stored_bytes = compressed.len(), "Blob stored");
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<Bytes> {
        let path = self.path_for(cid)?;
        let compressed = tokio::fs::read(&path)
            .await
            .map_err(|e| RecoveryError::storage("blob.get", format!("{cid}: {e}")))?;

        let decoded = tokio::task::spawn_blocking(move || zstd::decode_all(&compressed[..]))
            .await
            .map_err(|e| RecoveryError::storage("blob.get", e))?;

        match decoded {
            Ok(plain) => Ok(Bytes::from(plain)),
            // A blob that no longer decompresses is corrupt, not unavailable
            Err(e) => Err(RecoveryError::ChecksumMismatch {
                backup_id: cid.to_string(),
                step: "blob.decode".into(),
                expected: cid.to_string(),
                actual: format!("undecodable blob ({e})"),
            }),
        }
    }

    async fn delete(&self, cid: &str) -> Result<()> {
        let path = self.path_for(cid)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RecoveryError::storage("blob.delete", e)),
        }
    }

    async fn stats(&self) -> Result<BlobStats> {
        let mut stats = BlobStats::default();
        let mut shards = tokio::fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut blobs = tokio::fs::read_dir(shard.path()).await?;
            while let Some(blob) = blobs.next_entry().await? {
                if blob.path().extension().and_then(|e| e.to_str()) != Some("zst") {
                    continue;
                }
                stats.blob_count += 1;
                stats.total_bytes += blob.metadata().await?.len();
            }
        }
        Ok(stats)
    }
}

/// In-memory blob store. `corrupt` flips a byte for integrity drills.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn corrupt(&self, cid: &str) -> bool {
        let mut blobs = self.blobs.write().await;
        match blobs.get_mut(cid) {
            Some(blob) if !blob.is_empty() => {
                let mut bytes = blob.to_vec();
                let mid = bytes.len() / 2;
                bytes[mid] ^= 0x01;
                *blob = Bytes::from(bytes);
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, cid: &str) -> bool {
        self.blobs.read().await.contains_key(cid)
    }
}

#[async_trait]
impl StorageAdapter for MemoryBlobStore {
    async fn put(&self, payload: Bytes) -> Result<String> {
        let cid = cid_for(&payload);
        self.blobs.write().await.entry(cid.clone()).or_insert(payload);
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .await
            .get(cid)
            .cloned()
            .ok_or_else(|| RecoveryError::storage("blob.get", format!("{cid} not found")))
    }

    async fn delete(&self, cid: &str) -> Result<()> {
        self.blobs.write().await.remove(cid);
        Ok(())
    }

    async fn stats(&self) -> Result<BlobStats> {
        let blobs = self.blobs.read().await;
        Ok(BlobStats {
            blob_count: blobs.len() as u64,
            total_bytes: blobs.values().map(|b| b.len() as u64).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ErrorKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_store_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path().join("blobs"), 3).unwrap();

        let payload = Bytes::from_static(b"{\"kind\":\"full\",\"dataset\":{}}");
        let cid = store.put(payload.clone()).await.unwrap();
        assert_eq!(cid, cid_for(&payload));
        assert_eq!(store.put(payload.clone()).await.unwrap(), cid);

        assert_eq!(store.get(&cid).await.unwrap(), payload);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.blob_count, 1);
        assert!(stats.total_bytes > 0);

        store.delete(&cid).await.unwrap();
        store.delete(&cid).await.unwrap();
        let err = store.get(&cid).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[tokio::test]
    async fn test_fs_store_reports_undecodable_blob_as_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path(), 3).unwrap();
        let cid = store.put(Bytes::from(vec![7u8; 4096])).await.unwrap();

        let path = store.path_for(&cid).unwrap();
        std::fs::write(&path, b"not zstd at all").unwrap();

        let err = store.get(&cid).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    }

    #[tokio::test]
    async fn test_malformed_cids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path(), 3).unwrap();
        assert!(store.get("md5-1234").await.is_err());
        assert!(store.get("sha256-../../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_corruption_changes_content() {
        let store = MemoryBlobStore::new();
        let cid = store.put(Bytes::from_static(b"payload")).await.unwrap();
        assert!(store.corrupt(&cid).await);
        let bytes = store.get(&cid).await.unwrap();
        assert_ne!(cid_for(&bytes), cid);
        assert!(!store.corrupt("sha256-missing").await);
    }
}
