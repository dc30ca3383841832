//! Inbox import: picks up snapshot files dropped under a blob prefix.

use std::sync::Arc;

use anyhow::{Context, Result};
use onemap_core::ImportBatch;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::context::OneMapContext;
use crate::error::ReconcileError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct InboxRunSummary {
    pub imported: Vec<ImportBatch>,
    pub already_imported: Vec<String>,
    /// File name and the reason it was not imported.
    pub failed: Vec<(String, String)>,
}

pub struct InboxWatcher {
    ctx: Arc<OneMapContext>,
    prefix: String,
}

impl InboxWatcher {
    pub fn new(ctx: Arc<OneMapContext>) -> Self {
        let prefix = ctx.config.inbox_prefix.clone();
        Self { ctx, prefix }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Imports every `.csv` under the prefix whose file name has no completed
    /// batch, oldest snapshot first. One bad file does not stop the rest.
    pub async fn run_once(&self) -> Result<InboxRunSummary> {
        let mut summary = InboxRunSummary::default();
        let mut pending = Vec::new();
        for path in self.ctx.blobs.list(&self.prefix).await.context("listing inbox")? {
            let file_name = path.rsplit('/').next().unwrap_or(path.as_str()).to_string();
            if !file_name.to_ascii_lowercase().ends_with(".csv") {
                continue;
            }
            if self.ctx.ledger.completed_for_file(&file_name).await?.is_some() {
                summary.already_imported.push(file_name);
                continue;
            }
            match self.ctx.resolve_snapshot_date(&file_name, None) {
                Ok(date) => pending.push((date, file_name, path)),
                Err(err) => {
                    warn!(file_name = %file_name, error = %err, "skipping inbox file");
                    summary.failed.push((file_name, err.to_string()));
                }
            }
        }
        pending.sort();

        for (date, file_name, path) in pending {
            let bytes = match self.ctx.blobs.download(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(file_name = %file_name, path = %path, error = %err, "inbox download failed");
                    summary.failed.push((file_name, format!("downloading {path}: {err:#}")));
                    continue;
                }
            };
            let outcome = self
                .ctx
                .engine
                .import_bytes(&self.ctx.parser, &file_name, &bytes, date, self.ctx.apply_options(false))
                .await;
            match outcome {
                Ok(batch) => summary.imported.push(batch),
                Err(ReconcileError::DuplicateImport { file_name, .. }) => summary.already_imported.push(file_name),
                Err(err) => {
                    warn!(file_name = %file_name, error = %err, "inbox import failed");
                    summary.failed.push((file_name, err.to_string()));
                }
            }
        }
        info!(
            prefix = %self.prefix,
            imported = summary.imported.len(),
            already_imported = summary.already_imported.len(),
            failed = summary.failed.len(),
            "inbox run finished"
        );
        Ok(summary)
    }

    pub async fn build_scheduler(self: Arc<Self>, cron: &str) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let watcher = Arc::clone(&self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let watcher = Arc::clone(&watcher);
            Box::pin(async move {
                if let Err(err) = watcher.run_once().await {
                    warn!(error = %err, "scheduled inbox import failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}
