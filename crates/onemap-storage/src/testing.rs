//! Store doubles for exercising retry and partial-failure paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::document::{Document, DocumentStore, Filter, StoreError, WriteOp};

/// Wraps a store and fails scheduled `batch_write` calls, for exercising retry
/// and partial-failure paths.
pub struct FaultInjectingStore {
    inner: Arc<dyn DocumentStore>,
    transient_failures: AtomicUsize,
    fail_batches_touching: RwLock<Option<(String, String)>>,
    batch_writes: AtomicUsize,
}

impl FaultInjectingStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            transient_failures: AtomicUsize::new(0),
            fail_batches_touching: RwLock::new(None),
            batch_writes: AtomicUsize::new(0),
        }
    }

    /// The next `n` batch writes fail with a transient error.
    pub fn fail_next_batches(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Every batch write that touches `collection/id` fails transiently.
    pub async fn poison(&self, collection: &str, id: &str) {
        *self.fail_batches_touching.write().await = Some((collection.to_string(), id.to_string()));
    }

    pub async fn clear_poison(&self) {
        *self.fail_batches_touching.write().await = None;
    }

    pub fn batch_writes(&self) -> usize {
        self.batch_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for FaultInjectingStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(collection, id).await
    }

    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, StoreError> {
        self.inner.get_many(collection, ids).await
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        self.inner.put(collection, id, doc).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.inner.delete(collection, id).await
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        self.inner.query(collection, filter).await
    }

    async fn page(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.inner.page(collection, after, limit).await
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        let scheduled = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled {
            return Err(StoreError::Transient("injected batch failure".into()));
        }
        if let Some((poisoned_collection, poisoned_id)) = self.fail_batches_touching.read().await.clone() {
            let touches = ops.iter().any(|op| match op {
                WriteOp::Put { collection, id, .. } | WriteOp::Delete { collection, id } => {
                    *collection == poisoned_collection && *id == poisoned_id
                }
            });
            if touches {
                return Err(StoreError::Transient(format!(
                    "injected failure for {poisoned_collection}/{poisoned_id}"
                )));
            }
        }
        self.inner.batch_write(ops).await
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        self.inner.count(collection).await
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDocumentStore;
    use serde_json::json;

    #[tokio::test]
    async fn fault_injection_fails_scheduled_batches_only() {
        let inner: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let store = FaultInjectingStore::new(inner);
        store.fail_next_batches(1);
        let ops = vec![WriteOp::put("entities", "a", json!({}))];
        assert!(matches!(
            store.batch_write(ops.clone()).await,
            Err(StoreError::Transient(_))
        ));
        store.batch_write(ops).await.unwrap();
        assert_eq!(store.batch_writes(), 2);
        assert_eq!(store.count("entities").await.unwrap(), 1);
    }
}
