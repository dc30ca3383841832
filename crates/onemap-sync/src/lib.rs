//! Reconciliation, backup/recovery, diagnostics and scheduling for OneMap imports.

pub mod backup;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod export;
pub mod merge;
pub mod reports;
pub mod schedule;

pub use backup::{backup_collection_name, BackupManager, BACKUP_MANIFESTS, LIVE_COLLECTIONS, RESTORE_JOBS};
pub use config::{ImportProfile, MergeSection, StoreBackend, SyncConfig};
pub use context::OneMapContext;
pub use engine::{ApplyOptions, ReconciliationEngine, ReplaySummary, SnapshotInput};
pub use error::ReconcileError;
pub use export::{export_parquet, ParquetManifest, ParquetManifestFile};
pub use merge::{merge_attributes, CanonicalizationMode, FieldPolicies, MergePolicy, StatusCanonicalizer};
pub use reports::{
    batches_in_range, entity_history, find_duplicates, pole_drop_integrity, revert_report, status_distribution,
    BatchListing, DuplicateReport, EntityHistoryReport, PoleDropReport, PoleLoad, RevertReport, RevertSeverity,
    SharedDrop, StatusDistribution, StatusProgression, TransitionKind, DEFAULT_ADDRESS_THRESHOLD,
    MAX_DROPS_PER_POLE,
};
pub use schedule::{InboxRunSummary, InboxWatcher};

pub const CRATE_NAME: &str = "onemap-sync";
