use chrono::NaiveDate;
use onemap_snapshot::SnapshotError;
use onemap_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{file_name} was already imported by batch {batch_id}; rerun with force to apply it again")]
    DuplicateImport { file_name: String, batch_id: String },

    #[error(
        "{file_name} ({snapshot_date}) is older than the {recorded} snapshot already recorded for entity {entity_id}"
    )]
    OutOfOrderImport {
        file_name: String,
        batch_id: String,
        snapshot_date: NaiveDate,
        entity_id: String,
        recorded: NaiveDate,
    },

    #[error("batch {batch_id}: {failed_chunks} chunk(s) with {failed_records} record(s) could not be written: {source}")]
    StoreWrite {
        batch_id: String,
        failed_chunks: usize,
        failed_records: u64,
        #[source]
        source: StoreError,
    },

    #[error("backup {tag} is incomplete: {reason}")]
    BackupIncomplete { tag: String, reason: String },

    #[error("backup {0} does not exist")]
    BackupNotFound(String),

    #[error("restore from {0} requires explicit confirmation")]
    RestoreNotConfirmed(String),

    #[error("restore job {0} does not exist")]
    RestoreJobNotFound(String),

    #[error("restore job {job_id} stopped during {phase}; resume it to continue: {source}")]
    RestoreInterrupted {
        job_id: String,
        phase: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
