//! Core domain model for OneMap snapshot imports and status histories.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "onemap-core";

/// Canonical field name -> last observed value.
pub type Attributes = BTreeMap<String, String>;

/// One observed status value as of a snapshot date. Never edited once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub snapshot_date: NaiveDate,
    pub status: String,
    pub source_file: String,
    pub import_batch_id: String,
    #[serde(default)]
    pub agent: Option<String>,
}

/// Current-state document for one tracked property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    #[serde(default)]
    pub current_status: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub status_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub last_import_batch_id: Option<String>,
    #[serde(default)]
    pub last_snapshot_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(entity_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            current_status: None,
            attributes: Attributes::new(),
            status_history: Vec::new(),
            last_import_batch_id: None,
            last_snapshot_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn latest_entry(&self) -> Option<&HistoryEntry> {
        self.status_history.last()
    }

    /// Most recent snapshot date this entity has been touched by, from either
    /// the provenance stamp or the history log.
    pub fn latest_recorded_date(&self) -> Option<NaiveDate> {
        let from_history = self.latest_entry().map(|e| e.snapshot_date);
        match (self.last_snapshot_date, from_history) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Appends `entry` only when its status differs from the current one.
    /// Returns whether the history grew.
    pub fn record_status(&mut self, entry: HistoryEntry) -> bool {
        if self.current_status.as_deref() == Some(entry.status.as_str()) {
            return false;
        }
        self.current_status = Some(entry.status.clone());
        self.status_history.push(entry);
        true
    }

    /// Human-readable descriptions of broken history invariants; empty when healthy.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (idx, pair) in self.status_history.windows(2).enumerate() {
            if pair[0].status == pair[1].status {
                out.push(format!(
                    "entries {} and {} repeat status '{}'",
                    idx,
                    idx + 1,
                    pair[1].status
                ));
            }
            if pair[1].snapshot_date < pair[0].snapshot_date {
                out.push(format!(
                    "entry {} ({}) is older than entry {} ({})",
                    idx + 1,
                    pair[1].snapshot_date,
                    idx,
                    pair[0].snapshot_date
                ));
            }
        }
        let last_status = self.latest_entry().map(|e| e.status.as_str());
        if self.current_status.as_deref() != last_status {
            out.push(format!(
                "current status {:?} does not match last history entry {:?}",
                self.current_status, last_status
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Ledger entry describing one attempt to apply one snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub batch_id: String,
    pub file_name: String,
    pub snapshot_date: NaiveDate,
    pub imported_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub total_records: u64,
    pub new_entities: u64,
    pub status_change_count: u64,
    pub unchanged_count: u64,
    pub already_applied: u64,
    pub duplicate_rows: u64,
    pub skipped_records: u64,
    pub invalid_records: u64,
    pub failed_records: u64,
    pub validation_rate: f64,
    pub degraded: bool,
    pub forced: bool,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub error_detail: Vec<String>,
}

impl ImportBatch {
    pub fn new_pending(
        file_name: impl Into<String>,
        snapshot_date: NaiveDate,
        imported_at: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            file_name: file_name.into(),
            snapshot_date,
            imported_at,
            completed_at: None,
            status: BatchStatus::Pending,
            total_records: 0,
            new_entities: 0,
            status_change_count: 0,
            unchanged_count: 0,
            already_applied: 0,
            duplicate_rows: 0,
            skipped_records: 0,
            invalid_records: 0,
            failed_records: 0,
            validation_rate: 1.0,
            degraded: false,
            forced: false,
            content_hash: None,
            error_detail: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == BatchStatus::Pending
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.status = if self.error_detail.is_empty() {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        };
    }

    pub fn fail(&mut self, at: DateTime<Utc>, detail: impl Into<String>) {
        self.error_detail.push(detail.into());
        self.completed_at = Some(at);
        self.status = BatchStatus::Failed;
    }
}

/// Normalized handoff contract from the snapshot parser into reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub entity_id: String,
    pub status: Option<String>,
    pub agent: Option<String>,
    pub attributes: Attributes,
    pub line_number: u64,
}

impl ParsedRecord {
    pub fn new(entity_id: impl Into<String>, status: Option<&str>) -> Self {
        Self {
            entity_id: entity_id.into(),
            status: status.map(str::to_string),
            agent: None,
            attributes: Attributes::new(),
            line_number: 0,
        }
    }

    pub fn with_attribute(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(field.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    InProgress,
    Complete,
    Incomplete,
}

/// Resume point inside a paged copy: which collection, and the last id copied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyCursor {
    pub collection_index: usize,
    #[serde(default)]
    pub after_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub tag: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub state: BackupState,
    pub collections: Vec<String>,
    pub cursor: CopyCursor,
    #[serde(default)]
    pub copied: BTreeMap<String, u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BackupManifest {
    pub fn is_usable(&self) -> bool {
        self.state == BackupState::Complete
    }

    pub fn total_copied(&self) -> u64 {
        self.copied.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Clearing,
    Copying,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreJob {
    pub job_id: String,
    pub backup_tag: String,
    pub pre_restore_tag: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: RestorePhase,
    pub cursor: CopyCursor,
    #[serde(default)]
    pub cleared: BTreeMap<String, u64>,
    #[serde(default)]
    pub restored: BTreeMap<String, u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(date: &str, status: &str) -> HistoryEntry {
        HistoryEntry {
            snapshot_date: date.parse().expect("date"),
            status: status.to_string(),
            source_file: "Lawley_01082025.csv".to_string(),
            import_batch_id: "b1".to_string(),
            agent: None,
        }
    }

    #[test]
    fn repeated_status_is_not_appended() {
        let mut record = EntityRecord::new("P1", Utc::now());
        assert!(record.record_status(entry("2025-08-01", "Pole Permission: Approved")));
        assert!(!record.record_status(entry("2025-08-02", "Pole Permission: Approved")));
        assert!(record.record_status(entry("2025-08-03", "Home Sign Ups: Pending")));
        assert_eq!(record.status_history.len(), 2);
        assert_eq!(record.current_status.as_deref(), Some("Home Sign Ups: Pending"));
        assert!(record.invariant_violations().is_empty());
    }

    #[test]
    fn invariant_violations_flag_corrupted_history() {
        let mut record = EntityRecord::new("P2", Utc::now());
        record.status_history = vec![entry("2025-08-02", "A"), entry("2025-08-01", "A")];
        record.current_status = Some("B".to_string());
        let violations = record.invariant_violations();
        assert_eq!(violations.len(), 3, "{violations:?}");
    }

    #[test]
    fn latest_recorded_date_prefers_newest_stamp() {
        let mut record = EntityRecord::new("P3", Utc::now());
        assert_eq!(record.latest_recorded_date(), None);
        record.record_status(entry("2025-07-01", "A"));
        record.last_snapshot_date = Some("2025-07-04".parse().unwrap());
        assert_eq!(
            record.latest_recorded_date(),
            Some(NaiveDate::from_ymd_opt(2025, 7, 4).unwrap())
        );
    }

    #[test]
    fn batch_finish_reflects_errors() {
        let date = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        let mut ok = ImportBatch::new_pending("a.csv", date, Utc::now());
        ok.finish(Utc::now());
        assert_eq!(ok.status, BatchStatus::Completed);

        let mut bad = ImportBatch::new_pending("b.csv", date, Utc::now());
        bad.error_detail.push("chunk 2 failed".into());
        bad.finish(Utc::now());
        assert_eq!(bad.status, BatchStatus::Failed);
        assert_ne!(ok.batch_id, bad.batch_id);
    }

    #[test]
    fn batch_status_serializes_lowercase() {
        let json = serde_json::to_string(&BatchStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
