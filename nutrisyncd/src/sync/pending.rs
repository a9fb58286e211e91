use crate::storage::{StateStore, StoreError};

use super::now_millis;

/// Durable set of image paths awaiting analysis. Every mutation is written
/// through immediately so a crash never loses an accepted image.
#[derive(Clone)]
pub struct PendingQueue {
    store: StateStore,
}

impl PendingQueue {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Returns `false` when the path was already queued.
    pub async fn add(&self, path: &str) -> Result<bool, StoreError> {
        self.store.insert_pending(path, now_millis()).await
    }

    pub async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.store.delete_pending(path).await
    }

    /// Members in insertion order.
    pub async fn snapshot(&self) -> Result<Vec<String>, StoreError> {
        self.store.list_pending().await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.store.count_pending().await?.max(0) as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear_pending().await
    }
}
