//! Entity Store: one current-state document per entity, keyed by entity id.
//!
//! `upsert` / `upsert_chunk` are the only mutation paths. Each holds a per-key
//! async lock from read through commit, so two upserts of the same id never
//! interleave inside this process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use onemap_core::EntityRecord;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::document::{from_document, to_document, DocumentStore, StoreError, WriteOp};
use crate::retry::{with_retry, BackoffPolicy};

pub const ENTITIES: &str = "entities";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub without_status: u64,
    pub by_status: BTreeMap<String, u64>,
}

pub struct EntityStore {
    documents: Arc<dyn DocumentStore>,
    retry: BackoffPolicy,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EntityStore {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            documents,
            retry: BackoffPolicy::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn max_chunk_size(&self) -> usize {
        self.documents.max_batch_size().max(1)
    }

    pub async fn get(&self, entity_id: &str) -> Result<Option<EntityRecord>, StoreError> {
        let body = with_retry(&self.retry, "entities.get", || {
            self.documents.get(ENTITIES, entity_id)
        })
        .await?;
        body.map(|b| from_document(ENTITIES, entity_id, b))
            .transpose()
    }

    pub async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, EntityRecord>, StoreError> {
        let mut out = HashMap::with_capacity(ids.len());
        for slice in ids.chunks(self.max_chunk_size()) {
            let docs = with_retry(&self.retry, "entities.get_many", || {
                self.documents.get_many(ENTITIES, slice)
            })
            .await?;
            for doc in docs {
                let record: EntityRecord = from_document(ENTITIES, &doc.id, doc.body)?;
                out.insert(doc.id, record);
            }
        }
        Ok(out)
    }

    /// Atomic read-modify-write of one entity. The mutator sees the current
    /// record (if any) and returns the record to store (`None` = leave as is)
    /// together with an outcome value handed back to the caller.
    pub async fn upsert<T, F>(&self, entity_id: &str, mutator: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(Option<EntityRecord>) -> (Option<EntityRecord>, T) + Send,
    {
        let mut outcomes = self
            .upsert_chunk(vec![(entity_id.to_string(), mutator)])
            .await?;
        outcomes.pop().ok_or_else(|| StoreError::Conflict {
            collection: ENTITIES.to_string(),
            id: entity_id.to_string(),
            reason: "upsert produced no outcome".to_string(),
        })
    }

    /// Read-modify-write for many distinct entities, committed through
    /// `batch_write`. Outcomes are returned in input order.
    pub async fn upsert_chunk<T, F>(&self, items: Vec<(String, F)>) -> Result<Vec<T>, StoreError>
    where
        T: Send,
        F: FnOnce(Option<EntityRecord>) -> (Option<EntityRecord>, T) + Send,
    {
        let mut ids: Vec<String> = items.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != items.len() {
            return Err(StoreError::Conflict {
                collection: ENTITIES.to_string(),
                id: ids.first().cloned().unwrap_or_default(),
                reason: "the same entity appears twice in one chunk".to_string(),
            });
        }

        let guards = self.lock_keys(&ids).await;
        let result = self.apply_locked(&ids, items).await;
        drop(guards);
        self.release_idle_locks().await;
        result
    }

    async fn apply_locked<T, F>(&self, ids: &[String], items: Vec<(String, F)>) -> Result<Vec<T>, StoreError>
    where
        F: FnOnce(Option<EntityRecord>) -> (Option<EntityRecord>, T),
    {
        let mut current = self.get_many(ids).await?;
        let mut ops = Vec::new();
        let mut outcomes = Vec::with_capacity(items.len());
        for (id, mutator) in items {
            let (next, outcome) = mutator(current.remove(&id));
            if let Some(record) = next {
                if record.entity_id != id {
                    return Err(StoreError::Conflict {
                        collection: ENTITIES.to_string(),
                        id,
                        reason: format!("mutator renamed entity to '{}'", record.entity_id),
                    });
                }
                let doc = to_document(ENTITIES, &id, &record)?;
                ops.push(WriteOp::put(ENTITIES, id, doc));
            }
            outcomes.push(outcome);
        }

        for slice in ops.chunks(self.max_chunk_size()) {
            with_retry(&self.retry, "entities.batch_write", || {
                self.documents.batch_write(slice.to_vec())
            })
            .await?;
        }
        Ok(outcomes)
    }

    /// Locks are always taken in sorted id order so overlapping chunks cannot deadlock.
    async fn lock_keys(&self, sorted_ids: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let handles: Vec<Arc<Mutex<()>>> = {
            let mut map = self.locks.lock().await;
            sorted_ids
                .iter()
                .map(|id| {
                    map.entry(id.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(())))
                        .clone()
                })
                .collect()
        };
        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        guards
    }

    async fn release_idle_locks(&self) {
        let mut map = self.locks.lock().await;
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn scan(&self, page_size: usize) -> EntityScan<'_> {
        EntityScan {
            store: self,
            page_size: page_size.max(1),
            cursor: None,
            exhausted: false,
        }
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        with_retry(&self.retry, "entities.count", || self.documents.count(ENTITIES)).await
    }

    pub async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let mut counts = StatusCounts::default();
        let mut scan = self.scan(self.max_chunk_size());
        while let Some(page) = scan.next_page().await? {
            for record in page {
                counts.total += 1;
                match record.current_status {
                    Some(status) => *counts.by_status.entry(status).or_default() += 1,
                    None => counts.without_status += 1,
                }
            }
        }
        Ok(counts)
    }
}

/// Cursor-driven pass over every entity in id order. Restartable from any
/// cursor previously returned by [`EntityScan::cursor`].
pub struct EntityScan<'a> {
    store: &'a EntityStore,
    page_size: usize,
    cursor: Option<String>,
    exhausted: bool,
}

impl<'a> EntityScan<'a> {
    pub fn resume_after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self.exhausted = false;
        self
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<EntityRecord>>, StoreError> {
        if self.exhausted {
            return Ok(None);
        }
        let docs = with_retry(&self.store.retry, "entities.page", || {
            self.store
                .documents
                .page(ENTITIES, self.cursor.as_deref(), self.page_size)
        })
        .await?;
        if docs.len() < self.page_size {
            self.exhausted = true;
        }
        if docs.is_empty() {
            return Ok(None);
        }
        let mut page = Vec::with_capacity(docs.len());
        for doc in docs {
            self.cursor = Some(doc.id.clone());
            page.push(from_document::<EntityRecord>(ENTITIES, &doc.id, doc.body)?);
        }
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDocumentStore;
    use chrono::Utc;

    fn store() -> EntityStore {
        EntityStore::new(Arc::new(MemoryDocumentStore::new())).with_retry_policy(BackoffPolicy::immediate(1))
    }

    fn with_status(id: &str, status: Option<&str>) -> EntityRecord {
        let mut record = EntityRecord::new(id, Utc::now());
        record.current_status = status.map(str::to_string);
        record
    }

    #[tokio::test]
    async fn upsert_creates_then_mutates() {
        let entities = store();
        let created = entities
            .upsert("P1", |existing| {
                assert!(existing.is_none());
                (Some(with_status("P1", Some("A"))), "created")
            })
            .await
            .unwrap();
        assert_eq!(created, "created");

        let seen = entities
            .upsert("P1", |existing| {
                let status = existing.as_ref().and_then(|r| r.current_status.clone());
                (None, status)
            })
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn concurrent_upserts_of_one_key_do_not_lose_updates() {
        let entities = Arc::new(store());
        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..20 {
            let entities = entities.clone();
            tasks.spawn(async move {
                entities
                    .upsert("P1", move |existing| {
                        let mut record = existing.unwrap_or_else(|| EntityRecord::new("P1", Utc::now()));
                        record.attributes.insert(format!("touch_{n:02}"), n.to_string());
                        (Some(record), ())
                    })
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("task").expect("upsert");
        }
        let record = entities.get("P1").await.unwrap().expect("record");
        assert_eq!(record.attributes.len(), 20);
    }

    #[tokio::test]
    async fn chunk_rejects_duplicate_ids() {
        let entities = store();
        let untouched = |_: Option<EntityRecord>| (None::<EntityRecord>, ());
        let err = entities
            .upsert_chunk(vec![("P1".to_string(), untouched), ("P1".to_string(), untouched)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn scan_resumes_from_cursor_and_counts_statuses() {
        let entities = store();
        for (id, status) in [("P1", Some("A")), ("P2", Some("B")), ("P3", Some("A")), ("P4", None)] {
            entities
                .upsert(id, move |_| (Some(with_status(id, status)), ()))
                .await
                .unwrap();
        }

        let mut scan = entities.scan(2);
        let first = scan.next_page().await.unwrap().expect("first page");
        assert_eq!(first.len(), 2);
        let cursor = scan.cursor().map(str::to_string);
        assert_eq!(cursor.as_deref(), Some("P2"));

        let mut resumed = entities.scan(2).resume_after(cursor);
        let rest = resumed.next_page().await.unwrap().expect("second page");
        assert_eq!(rest.iter().map(|r| r.entity_id.as_str()).collect::<Vec<_>>(), ["P3", "P4"]);
        assert!(resumed.next_page().await.unwrap().is_none());

        let counts = entities.count_by_status().await.unwrap();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.without_status, 1);
        assert_eq!(counts.by_status.get("A"), Some(&2));
        assert_eq!(counts.by_status.get("B"), Some(&1));
    }
}
