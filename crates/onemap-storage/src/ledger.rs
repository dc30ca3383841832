//! Import Ledger: append-only record of import batches, one document per batch id.

use std::sync::Arc;

use chrono::NaiveDate;
use onemap_core::{BatchStatus, ImportBatch};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::document::{from_document, to_document, DocumentStore, Filter, StoreError};
use crate::retry::{with_retry, BackoffPolicy};

pub const IMPORT_BATCHES: &str = "import_batches";

pub struct ImportLedger {
    documents: Arc<dyn DocumentStore>,
    retry: BackoffPolicy,
    write_lock: Mutex<()>,
}

impl ImportLedger {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            documents,
            retry: BackoffPolicy::default(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Appends a new batch. An existing batch id is never overwritten.
    pub async fn record_batch(&self, batch: &ImportBatch) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.get(&batch.batch_id).await?.is_some() {
            return Err(StoreError::AlreadyExists {
                collection: IMPORT_BATCHES.to_string(),
                id: batch.batch_id.clone(),
            });
        }
        self.write(batch).await?;
        debug!(batch_id = %batch.batch_id, file_name = %batch.file_name, "recorded import batch");
        Ok(())
    }

    /// Replaces a batch's counters and status. Only `pending` batches may change;
    /// completed and failed batches are final.
    pub async fn update_batch_status(&self, batch: &ImportBatch) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.get(&batch.batch_id).await?.ok_or_else(|| StoreError::Conflict {
            collection: IMPORT_BATCHES.to_string(),
            id: batch.batch_id.clone(),
            reason: "batch was never recorded".to_string(),
        })?;
        if existing.status != BatchStatus::Pending {
            return Err(StoreError::Conflict {
                collection: IMPORT_BATCHES.to_string(),
                id: batch.batch_id.clone(),
                reason: format!("batch is already {}", existing.status.as_str()),
            });
        }
        if existing.file_name != batch.file_name {
            return Err(StoreError::Conflict {
                collection: IMPORT_BATCHES.to_string(),
                id: batch.batch_id.clone(),
                reason: "file name of a recorded batch cannot change".to_string(),
            });
        }
        self.write(batch).await?;
        debug!(batch_id = %batch.batch_id, status = batch.status.as_str(), "updated import batch");
        Ok(())
    }

    async fn write(&self, batch: &ImportBatch) -> Result<(), StoreError> {
        let doc = to_document(IMPORT_BATCHES, &batch.batch_id, batch)?;
        with_retry(&self.retry, "ledger.put", || {
            self.documents.put(IMPORT_BATCHES, &batch.batch_id, doc.clone())
        })
        .await
    }

    pub async fn get(&self, batch_id: &str) -> Result<Option<ImportBatch>, StoreError> {
        let body = with_retry(&self.retry, "ledger.get", || {
            self.documents.get(IMPORT_BATCHES, batch_id)
        })
        .await?;
        body.map(|b| from_document(IMPORT_BATCHES, batch_id, b))
            .transpose()
    }

    /// Every batch for `file_name`, oldest attempt first.
    pub async fn find_by_file_name(&self, file_name: &str) -> Result<Vec<ImportBatch>, StoreError> {
        self.select(&Filter::eq("file_name", file_name)).await
    }

    pub async fn completed_for_file(&self, file_name: &str) -> Result<Option<ImportBatch>, StoreError> {
        Ok(self
            .find_by_file_name(file_name)
            .await?
            .into_iter()
            .filter(|b| b.status == BatchStatus::Completed)
            .last())
    }

    pub async fn pending_for_file(&self, file_name: &str) -> Result<Option<ImportBatch>, StoreError> {
        Ok(self
            .find_by_file_name(file_name)
            .await?
            .into_iter()
            .filter(ImportBatch::is_pending)
            .last())
    }

    /// Batches whose snapshot date lies in the inclusive range; open ends are unbounded.
    pub async fn in_date_range(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<ImportBatch>, StoreError> {
        let bound = |d: NaiveDate| Value::String(d.format("%Y-%m-%d").to_string());
        let mut batches = self
            .select(&Filter::range("snapshot_date", from.map(bound), to.map(bound)))
            .await?;
        batches.sort_by(|a, b| {
            (a.snapshot_date, a.imported_at).cmp(&(b.snapshot_date, b.imported_at))
        });
        Ok(batches)
    }

    pub async fn all(&self) -> Result<Vec<ImportBatch>, StoreError> {
        self.select(&Filter::All).await
    }

    async fn select(&self, filter: &Filter) -> Result<Vec<ImportBatch>, StoreError> {
        let docs = with_retry(&self.retry, "ledger.query", || {
            self.documents.query(IMPORT_BATCHES, filter)
        })
        .await?;
        let mut batches = docs
            .into_iter()
            .map(|doc| from_document::<ImportBatch>(IMPORT_BATCHES, &doc.id, doc.body))
            .collect::<Result<Vec<_>, _>>()?;
        batches.sort_by(|a, b| a.imported_at.cmp(&b.imported_at).then_with(|| a.batch_id.cmp(&b.batch_id)));
        Ok(batches)
    }
}
