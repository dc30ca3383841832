use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use onemap_core::ImportBatch;
use onemap_snapshot::{extract_snapshot_date, SnapshotParser};
use onemap_storage::{
    sha256_hex, BackoffPolicy, BlobStore, DocumentStore, EntityStore, FsBlobStore, FsDocumentStore, ImportLedger,
    MemoryDocumentStore, PgDocumentStore,
};
use tracing::info;

use crate::backup::BackupManager;
use crate::config::{ImportProfile, StoreBackend, SyncConfig};
use crate::engine::{ApplyOptions, ReconciliationEngine, ReplaySummary, SnapshotInput};

/// Every client an operation needs, built once and passed explicitly.
pub struct OneMapContext {
    pub config: SyncConfig,
    pub profile: ImportProfile,
    pub documents: Arc<dyn DocumentStore>,
    pub entities: Arc<EntityStore>,
    pub ledger: Arc<ImportLedger>,
    pub parser: SnapshotParser,
    pub engine: ReconciliationEngine,
    pub backups: BackupManager,
    pub blobs: Arc<dyn BlobStore>,
}

impl OneMapContext {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let profile = ImportProfile::load(&config.profile_path).await?;
        let documents: Arc<dyn DocumentStore> = match config.backend {
            StoreBackend::Memory => Arc::new(MemoryDocumentStore::new()),
            StoreBackend::Fs => Arc::new(FsDocumentStore::new(config.documents_dir())),
            StoreBackend::Postgres => {
                let store = PgDocumentStore::connect(&config.database_url, config.db_max_connections).await?;
                store.run_migrations().await?;
                Arc::new(store)
            }
        };
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.blobs_dir()));
        info!(backend = ?config.backend, data_dir = %config.data_dir.display(), "onemap context ready");
        Self::with_store(config, profile, documents, blobs)
    }

    pub fn with_store(
        config: SyncConfig,
        profile: ImportProfile,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let retry = BackoffPolicy {
            max_retries: config.max_retries,
            ..BackoffPolicy::default()
        };
        Self::with_retry_policy(config, profile, documents, blobs, retry)
    }

    pub fn with_retry_policy(
        config: SyncConfig,
        profile: ImportProfile,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        retry: BackoffPolicy,
    ) -> Result<Self> {
        let parser = SnapshotParser::new(profile.snapshot.clone()).context("building snapshot parser")?;
        let entities = Arc::new(EntityStore::new(Arc::clone(&documents)).with_retry_policy(retry));
        let ledger = Arc::new(ImportLedger::new(Arc::clone(&documents)).with_retry_policy(retry));
        let engine = ReconciliationEngine::new(Arc::clone(&entities), Arc::clone(&ledger))
            .with_field_policies(profile.field_policies())
            .with_canonicalizer(profile.canonicalizer())
            .with_options(profile.apply_options(&config));
        let backups = BackupManager::new(Arc::clone(&documents)).with_retry_policy(retry);
        Ok(Self {
            config,
            profile,
            documents,
            entities,
            ledger,
            parser,
            engine,
            backups,
            blobs,
        })
    }

    pub fn apply_options(&self, force: bool) -> ApplyOptions {
        self.engine.options().forced(force)
    }

    /// An explicit date wins; otherwise the date is read from the file name.
    pub fn resolve_snapshot_date(&self, file_name: &str, explicit: Option<NaiveDate>) -> Result<NaiveDate> {
        explicit
            .or_else(|| extract_snapshot_date(file_name, self.config.fallback_year))
            .ok_or_else(|| anyhow!("cannot tell the snapshot date of {file_name}; pass --snapshot-date"))
    }

    pub async fn import_file(&self, path: &Path, snapshot_date: Option<NaiveDate>, force: bool) -> Result<ImportBatch> {
        let file_name = file_name_of(path)?;
        let date = self.resolve_snapshot_date(&file_name, snapshot_date)?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let batch = self
            .engine
            .import_bytes(&self.parser, &file_name, &bytes, date, self.apply_options(force))
            .await?;
        Ok(batch)
    }

    /// Rebuild mode over local files, applied oldest snapshot first.
    pub async fn replay_files(&self, paths: &[impl AsRef<Path>], force: bool) -> Result<ReplaySummary> {
        let mut inputs = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let file_name = file_name_of(path)?;
            let date = self.resolve_snapshot_date(&file_name, None)?;
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let parsed = self
                .parser
                .parse(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?;
            inputs.push(
                SnapshotInput::new(file_name, date, parsed.records)
                    .with_report(parsed.report)
                    .with_content_hash(sha256_hex(&bytes)),
            );
        }
        Ok(self.engine.replay(inputs, self.apply_options(force)).await?)
    }

    /// Applies the document-store schema; only the Postgres backend has one.
    pub async fn migrate(config: &SyncConfig) -> Result<()> {
        match config.backend {
            StoreBackend::Postgres => {
                let store = PgDocumentStore::connect(&config.database_url, config.db_max_connections).await?;
                store.run_migrations().await?;
                info!("document store migrations applied");
            }
            backend => info!(?backend, "backend has no schema to migrate"),
        }
        Ok(())
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))
}
