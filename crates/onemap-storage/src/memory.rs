use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::document::{
    validate_collection, Document, DocumentStore, Filter, StoreError, WriteOp,
    DEFAULT_MAX_BATCH_SIZE,
};

type Collections = BTreeMap<String, BTreeMap<String, Value>>;

/// Process-local store. `batch_write` applies all operations under one write lock.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<Collections>,
    max_batch_size: Option<usize>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size.max(1));
        self
    }

    /// Every document of a collection, ordered by id. Test and diagnostics helper.
    pub async fn dump(&self, collection: &str) -> BTreeMap<String, Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        validate_collection(collection)?;
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        validate_collection(collection)?;
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        validate_collection(collection)?;
        if let Some(docs) = self.collections.write().await.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        validate_collection(collection)?;
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, body)| filter.matches(body))
                    .map(|(id, body)| Document {
                        id: id.clone(),
                        body: body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn page(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        validate_collection(collection)?;
        let guard = self.collections.read().await;
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };
        Ok(docs
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(id, body)| Document {
                id: id.clone(),
                body: body.clone(),
            })
            .collect())
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        for op in &ops {
            validate_collection(op.collection())?;
        }
        let mut guard = self.collections.write().await;
        for op in ops {
            match op {
                WriteOp::Put {
                    collection,
                    id,
                    doc,
                } => {
                    guard.entry(collection).or_default().insert(id, doc);
                }
                WriteOp::Delete { collection, id } => {
                    if let Some(docs) = guard.get_mut(&collection) {
                        docs.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        validate_collection(collection)?;
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|docs| docs.len() as u64)
            .unwrap_or(0))
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn paging_walks_ids_in_order() {
        let store = MemoryDocumentStore::new();
        for id in ["c", "a", "b", "d"] {
            store.put("entities", id, json!({"entity_id": id})).await.unwrap();
        }
        let first = store.page("entities", None, 2).await.unwrap();
        assert_eq!(first.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        let second = store.page("entities", Some("b"), 2).await.unwrap();
        assert_eq!(second.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["c", "d"]);
        assert!(store.page("entities", Some("d"), 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_write_applies_puts_and_deletes() {
        let store = MemoryDocumentStore::new();
        store.put("entities", "old", json!({})).await.unwrap();
        store
            .batch_write(vec![
                WriteOp::put("entities", "new", json!({"x": 1})),
                WriteOp::delete("entities", "old"),
            ])
            .await
            .unwrap();
        assert_eq!(store.count("entities").await.unwrap(), 1);
        assert_eq!(store.get("entities", "new").await.unwrap(), Some(json!({"x": 1})));
    }
}
