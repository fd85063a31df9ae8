//! The live system state that backups snapshot and restores mutate.
//!
//! The business side owns the real collections; it plugs in here by
//! implementing [`LiveData`]. `MemoryLiveData` backs the server and tests.

use crate::models::Dataset;
use crate::utils::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait LiveData: Send + Sync {
    /// Consistent copy of every in-scope collection.
    async fn snapshot(&self) -> Result<Dataset>;

    /// Atomically replace the in-scope collections with `staged`.
    async fn swap(&self, staged: Dataset) -> Result<()>;

    /// Upsert staged documents by key without dropping anything.
    async fn merge(&self, staged: &Dataset) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryLiveData {
    data: RwLock<Dataset>,
}

impl MemoryLiveData {
    pub fn new(initial: Dataset) -> Self {
        Self {
            data: RwLock::new(initial),
        }
    }

    /// Replace the data outside of any restore (business-side writes).
    pub async fn replace(&self, dataset: Dataset) {
        *self.data.write().await = dataset;
    }

    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Dataset),
    {
        let mut data = self.data.write().await;
        f(&mut data);
    }
}

#[async_trait]
impl LiveData for MemoryLiveData {
    async fn snapshot(&self) -> Result<Dataset> {
        Ok(self.data.read().await.clone())
    }

    async fn swap(&self, staged: Dataset) -> Result<()> {
        *self.data.write().await = staged;
        Ok(())
    }

    async fn merge(&self, staged: &Dataset) -> Result<usize> {
        Ok(self.data.write().await.merge(staged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_swap_replaces_and_merge_keeps() {
        let mut initial = Dataset::new();
        initial.insert("orders", "o1", json!({"qty": 1}));
        let live = MemoryLiveData::new(initial);

        let mut staged = Dataset::new();
        staged.insert("products", "p1", json!({"price": 3}));

        assert_eq!(live.merge(&staged).await.unwrap(), 1);
        let snap = live.snapshot().await.unwrap();
        assert_eq!(snap.collection_count(), 2);

        live.swap(staged.clone()).await.unwrap();
        assert_eq!(live.snapshot().await.unwrap(), staged);
    }
}
