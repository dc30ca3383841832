//! Backup/Recovery Manager: cursor-driven copies of the live collections into
//! tagged backup collections, and confirmed, resumable restores back out of them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use onemap_core::{BackupManifest, BackupState, CopyCursor, RestoreJob, RestorePhase};
use onemap_storage::{
    from_document, to_document, with_retry, BackoffPolicy, Document, DocumentStore, Filter, StoreError, WriteOp,
    ENTITIES, IMPORT_BATCHES,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ReconcileError;

pub const BACKUP_MANIFESTS: &str = "backup_manifests";
pub const RESTORE_JOBS: &str = "restore_jobs";
pub const LIVE_COLLECTIONS: [&str; 2] = [ENTITIES, IMPORT_BATCHES];
pub const DEFAULT_COPY_PAGE: usize = 500;

pub fn backup_collection_name(tag: &str, collection: &str) -> String {
    format!("backup__{tag}__{collection}")
}

fn new_tag(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("bk-{}-{}", now.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

pub struct BackupManager {
    documents: Arc<dyn DocumentStore>,
    retry: BackoffPolicy,
    page_size: usize,
}

impl BackupManager {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            documents,
            retry: BackoffPolicy::default(),
            page_size: DEFAULT_COPY_PAGE,
        }
    }

    pub fn with_retry_policy(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Copies every live collection into a new tagged backup.
    pub async fn backup(&self, reason: &str) -> Result<BackupManifest, ReconcileError> {
        let now = Utc::now();
        let manifest = BackupManifest {
            tag: new_tag(now),
            reason: reason.to_string(),
            created_at: now,
            completed_at: None,
            state: BackupState::InProgress,
            collections: LIVE_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            cursor: CopyCursor::default(),
            copied: BTreeMap::new(),
            error: None,
        };
        self.save_manifest(&manifest).await?;
        info!(tag = %manifest.tag, reason, "backup started");
        self.run_backup(manifest).await
    }

    /// Continues an interrupted backup from its persisted cursor.
    pub async fn resume_backup(&self, tag: &str) -> Result<BackupManifest, ReconcileError> {
        let mut manifest = self
            .manifest(tag)
            .await?
            .ok_or_else(|| ReconcileError::BackupNotFound(tag.to_string()))?;
        if manifest.is_usable() {
            return Ok(manifest);
        }
        info!(tag, collection_index = manifest.cursor.collection_index, "resuming backup");
        manifest.state = BackupState::InProgress;
        manifest.error = None;
        self.save_manifest(&manifest).await?;
        self.run_backup(manifest).await
    }

    async fn run_backup(&self, mut manifest: BackupManifest) -> Result<BackupManifest, ReconcileError> {
        match self.copy_into_backup(&mut manifest).await {
            Ok(()) => {
                manifest.state = BackupState::Complete;
                manifest.completed_at = Some(Utc::now());
                self.save_manifest(&manifest).await?;
                info!(tag = %manifest.tag, copied = manifest.total_copied(), "backup complete");
                Ok(manifest)
            }
            Err(err) => {
                manifest.state = BackupState::Incomplete;
                manifest.error = Some(err.to_string());
                if let Err(save_err) = self.save_manifest(&manifest).await {
                    warn!(tag = %manifest.tag, error = %save_err, "could not mark backup incomplete");
                }
                warn!(tag = %manifest.tag, error = %err, "backup incomplete");
                Err(ReconcileError::BackupIncomplete {
                    tag: manifest.tag,
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn copy_into_backup(&self, manifest: &mut BackupManifest) -> Result<(), StoreError> {
        while manifest.cursor.collection_index < manifest.collections.len() {
            let source = manifest.collections[manifest.cursor.collection_index].clone();
            let target = backup_collection_name(&manifest.tag, &source);
            loop {
                let page = self.page(&source, manifest.cursor.after_id.as_deref()).await?;
                let Some(last) = page.last().map(|d| d.id.clone()) else {
                    break;
                };
                let ops = page
                    .into_iter()
                    .map(|d| WriteOp::put(&target, d.id, d.body))
                    .collect::<Vec<_>>();
                self.write(ops).await?;
                manifest.cursor.after_id = Some(last);
                self.save_manifest(manifest).await?;
            }
            let copied = self.count(&target).await?;
            manifest.copied.insert(source, copied);
            manifest.cursor = CopyCursor {
                collection_index: manifest.cursor.collection_index + 1,
                after_id: None,
            };
            self.save_manifest(manifest).await?;
        }
        Ok(())
    }

    /// Replaces the live collections with the contents of backup `tag`.
    /// Takes a pre-restore backup first, so a bad restore can itself be undone.
    pub async fn restore(&self, tag: &str, confirmed: bool) -> Result<RestoreJob, ReconcileError> {
        if !confirmed {
            return Err(ReconcileError::RestoreNotConfirmed(tag.to_string()));
        }
        let manifest = self
            .manifest(tag)
            .await?
            .ok_or_else(|| ReconcileError::BackupNotFound(tag.to_string()))?;
        if !manifest.is_usable() {
            return Err(ReconcileError::BackupIncomplete {
                tag: tag.to_string(),
                reason: format!("backup is {:?}, not complete", manifest.state),
            });
        }

        let safety = self.backup(&format!("pre-restore of {tag}")).await?;
        let job = RestoreJob {
            job_id: Uuid::new_v4().to_string(),
            backup_tag: tag.to_string(),
            pre_restore_tag: safety.tag,
            started_at: Utc::now(),
            finished_at: None,
            phase: RestorePhase::Clearing,
            cursor: CopyCursor::default(),
            cleared: BTreeMap::new(),
            restored: BTreeMap::new(),
            error: None,
        };
        self.save_job(&job).await?;
        info!(job_id = %job.job_id, tag, pre_restore = %job.pre_restore_tag, "restore started");
        self.run_restore(job, &manifest).await
    }

    pub async fn resume_restore(&self, job_id: &str) -> Result<RestoreJob, ReconcileError> {
        let mut job = self
            .restore_job(job_id)
            .await?
            .ok_or_else(|| ReconcileError::RestoreJobNotFound(job_id.to_string()))?;
        if job.phase == RestorePhase::Done {
            return Ok(job);
        }
        let manifest = match self.manifest(&job.backup_tag).await? {
            Some(manifest) if manifest.is_usable() => manifest,
            _ => {
                job.phase = RestorePhase::Failed;
                job.error = Some(format!("backup {} is no longer available", job.backup_tag));
                job.finished_at = Some(Utc::now());
                self.save_job(&job).await?;
                return Err(ReconcileError::BackupNotFound(job.backup_tag));
            }
        };
        info!(job_id, phase = ?job.phase, "resuming restore");
        job.error = None;
        self.run_restore(job, &manifest).await
    }

    async fn run_restore(&self, mut job: RestoreJob, manifest: &BackupManifest) -> Result<RestoreJob, ReconcileError> {
        match self.drive_restore(&mut job, manifest).await {
            Ok(()) => {
                job.phase = RestorePhase::Done;
                job.finished_at = Some(Utc::now());
                self.save_job(&job).await?;
                info!(job_id = %job.job_id, tag = %job.backup_tag, restored = ?job.restored, "restore complete");
                Ok(job)
            }
            Err(source) => {
                job.error = Some(source.to_string());
                if let Err(save_err) = self.save_job(&job).await {
                    warn!(job_id = %job.job_id, error = %save_err, "could not record restore failure");
                }
                warn!(job_id = %job.job_id, phase = ?job.phase, error = %source, "restore interrupted");
                Err(ReconcileError::RestoreInterrupted {
                    job_id: job.job_id,
                    phase: format!("{:?}", job.phase).to_lowercase(),
                    source,
                })
            }
        }
    }

    async fn drive_restore(&self, job: &mut RestoreJob, manifest: &BackupManifest) -> Result<(), StoreError> {
        if job.phase == RestorePhase::Clearing {
            for collection in &manifest.collections {
                // Deleted documents drop out of the next page, so always read from the start.
                loop {
                    let page = self.page(collection, None).await?;
                    if page.is_empty() {
                        break;
                    }
                    let n = page.len() as u64;
                    let ops = page
                        .into_iter()
                        .map(|d| WriteOp::delete(collection, d.id))
                        .collect::<Vec<_>>();
                    self.write(ops).await?;
                    *job.cleared.entry(collection.clone()).or_default() += n;
                    self.save_job(job).await?;
                }
            }
            job.phase = RestorePhase::Copying;
            job.cursor = CopyCursor::default();
            self.save_job(job).await?;
        }

        while job.cursor.collection_index < manifest.collections.len() {
            let target = manifest.collections[job.cursor.collection_index].clone();
            let source = backup_collection_name(&manifest.tag, &target);
            loop {
                let page = self.page(&source, job.cursor.after_id.as_deref()).await?;
                let Some(last) = page.last().map(|d| d.id.clone()) else {
                    break;
                };
                let ops = page
                    .into_iter()
                    .map(|d| WriteOp::put(&target, d.id, d.body))
                    .collect::<Vec<_>>();
                self.write(ops).await?;
                job.cursor.after_id = Some(last);
                self.save_job(job).await?;
            }
            let restored = self.count(&target).await?;
            job.restored.insert(target, restored);
            job.cursor = CopyCursor {
                collection_index: job.cursor.collection_index + 1,
                after_id: None,
            };
            self.save_job(job).await?;
        }
        Ok(())
    }

    /// All backups, oldest first.
    pub async fn list(&self) -> Result<Vec<BackupManifest>, ReconcileError> {
        let docs = with_retry(&self.retry, "backups.list", || {
            self.documents.query(BACKUP_MANIFESTS, &Filter::All)
        })
        .await?;
        let mut manifests = docs
            .into_iter()
            .map(|d| from_document::<BackupManifest>(BACKUP_MANIFESTS, &d.id, d.body))
            .collect::<Result<Vec<_>, _>>()?;
        manifests.sort_by(|a, b| (a.created_at, &a.tag).cmp(&(b.created_at, &b.tag)));
        Ok(manifests)
    }

    pub async fn latest_complete(&self) -> Result<Option<BackupManifest>, ReconcileError> {
        Ok(self.list().await?.into_iter().filter(|m| m.is_usable()).last())
    }

    pub async fn restore_jobs(&self) -> Result<Vec<RestoreJob>, ReconcileError> {
        let docs = with_retry(&self.retry, "restore_jobs.list", || {
            self.documents.query(RESTORE_JOBS, &Filter::All)
        })
        .await?;
        let mut jobs = docs
            .into_iter()
            .map(|d| from_document::<RestoreJob>(RESTORE_JOBS, &d.id, d.body))
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|j| j.started_at);
        Ok(jobs)
    }

    /// Deletes backup `tag` and its copied collections. Returns how many documents were removed.
    pub async fn purge(&self, tag: &str) -> Result<u64, ReconcileError> {
        let manifest = self
            .manifest(tag)
            .await?
            .ok_or_else(|| ReconcileError::BackupNotFound(tag.to_string()))?;
        let mut removed = 0u64;
        for collection in &manifest.collections {
            let target = backup_collection_name(tag, collection);
            loop {
                let page = self.page(&target, None).await?;
                if page.is_empty() {
                    break;
                }
                removed += page.len() as u64;
                let ops = page
                    .into_iter()
                    .map(|d| WriteOp::delete(&target, d.id))
                    .collect::<Vec<_>>();
                self.write(ops).await?;
            }
        }
        with_retry(&self.retry, "backups.delete_manifest", || {
            self.documents.delete(BACKUP_MANIFESTS, tag)
        })
        .await?;
        info!(tag, removed, "backup purged");
        Ok(removed)
    }

    /// Keeps the newest `keep_last` complete backups and purges older complete ones.
    /// Incomplete backups are left alone so they can still be resumed or inspected.
    pub async fn prune(&self, keep_last: usize) -> Result<Vec<String>, ReconcileError> {
        let complete: Vec<BackupManifest> = self.list().await?.into_iter().filter(|m| m.is_usable()).collect();
        let excess = complete.len().saturating_sub(keep_last);
        let mut purged = Vec::with_capacity(excess);
        for manifest in complete.into_iter().take(excess) {
            self.purge(&manifest.tag).await?;
            purged.push(manifest.tag);
        }
        Ok(purged)
    }

    pub async fn manifest(&self, tag: &str) -> Result<Option<BackupManifest>, ReconcileError> {
        let doc = with_retry(&self.retry, "backups.get", || self.documents.get(BACKUP_MANIFESTS, tag)).await?;
        Ok(doc
            .map(|body| from_document(BACKUP_MANIFESTS, tag, body))
            .transpose()?)
    }

    pub async fn restore_job(&self, job_id: &str) -> Result<Option<RestoreJob>, ReconcileError> {
        let doc = with_retry(&self.retry, "restore_jobs.get", || self.documents.get(RESTORE_JOBS, job_id)).await?;
        Ok(doc.map(|body| from_document(RESTORE_JOBS, job_id, body)).transpose()?)
    }

    async fn save_manifest(&self, manifest: &BackupManifest) -> Result<(), StoreError> {
        let doc = to_document(BACKUP_MANIFESTS, &manifest.tag, manifest)?;
        with_retry(&self.retry, "backups.save_manifest", || {
            self.documents.put(BACKUP_MANIFESTS, &manifest.tag, doc.clone())
        })
        .await
    }

    async fn save_job(&self, job: &RestoreJob) -> Result<(), StoreError> {
        let doc = to_document(RESTORE_JOBS, &job.job_id, job)?;
        with_retry(&self.retry, "restore_jobs.save", || {
            self.documents.put(RESTORE_JOBS, &job.job_id, doc.clone())
        })
        .await
    }

    async fn page(&self, collection: &str, after: Option<&str>) -> Result<Vec<Document>, StoreError> {
        with_retry(&self.retry, "backups.page", || {
            self.documents.page(collection, after, self.page_size)
        })
        .await
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        with_retry(&self.retry, "backups.count", || self.documents.count(collection)).await
    }

    async fn write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        for slice in ops.chunks(self.documents.max_batch_size().max(1)) {
            with_retry(&self.retry, "backups.batch_write", || {
                self.documents.batch_write(slice.to_vec())
            })
            .await?;
        }
        Ok(())
    }
}
