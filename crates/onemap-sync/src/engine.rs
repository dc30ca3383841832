//! Reconciliation Engine: applies one snapshot to the Entity Store and keeps
//! the Import Ledger in step with what was applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use onemap_core::{EntityRecord, HistoryEntry, ImportBatch, ParsedRecord};
use onemap_snapshot::{SnapshotParser, ValidationReport, AGENT};
use onemap_storage::{sha256_hex, EntityStore, ImportLedger, StoreError};
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::merge::{merge_attributes, FieldPolicies, StatusCanonicalizer};

pub const DEFAULT_WRITE_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// One snapshot ready for reconciliation.
#[derive(Debug, Clone)]
pub struct SnapshotInput {
    pub file_name: String,
    pub snapshot_date: NaiveDate,
    pub records: Vec<ParsedRecord>,
    pub report: Option<ValidationReport>,
    pub content_hash: Option<String>,
}

impl SnapshotInput {
    pub fn new(file_name: impl Into<String>, snapshot_date: NaiveDate, records: Vec<ParsedRecord>) -> Self {
        Self {
            file_name: file_name.into(),
            snapshot_date,
            records,
            report: None,
            content_hash: None,
        }
    }

    pub fn with_report(mut self, report: ValidationReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn with_content_hash(mut self, content_hash: impl Into<String>) -> Self {
        self.content_hash = Some(content_hash.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Apply even when the file already has a completed batch.
    pub force: bool,
    pub write_batch_size: usize,
    pub max_in_flight: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            force: false,
            write_batch_size: DEFAULT_WRITE_BATCH_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl ApplyOptions {
    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaySummary {
    pub applied: Vec<ImportBatch>,
    /// Files skipped because they already had a completed batch.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    AlreadyApplied,
    Unchanged,
    Changed,
}

#[derive(Debug, Default)]
struct ChunkTally {
    new_entities: u64,
    status_changes: u64,
    unchanged: u64,
    already_applied: u64,
}

struct ChunkResult {
    index: usize,
    size: u64,
    first_id: String,
    last_id: String,
    result: Result<ChunkTally, StoreError>,
}

/// Everything a chunk task needs; shared read-only across in-flight chunks.
struct ChunkContext {
    entities: Arc<EntityStore>,
    policies: Arc<FieldPolicies>,
    canonicalizer: StatusCanonicalizer,
    batch_id: String,
    file_name: String,
    snapshot_date: NaiveDate,
    now: DateTime<Utc>,
}

impl ChunkContext {
    fn reconcile(&self, record: ParsedRecord, existing: Option<EntityRecord>) -> (Option<EntityRecord>, Outcome) {
        let ParsedRecord {
            entity_id,
            status,
            agent,
            mut attributes,
            ..
        } = record;
        if let Some(agent) = &agent {
            attributes.insert(AGENT.to_string(), agent.clone());
        }
        let entry = |status: String| HistoryEntry {
            snapshot_date: self.snapshot_date,
            status,
            source_file: self.file_name.clone(),
            import_batch_id: self.batch_id.clone(),
            agent: agent.clone(),
        };

        match existing {
            None => {
                let mut entity = EntityRecord::new(entity_id, self.now);
                merge_attributes(&mut entity.attributes, &attributes, &self.policies);
                if let Some(status) = status {
                    entity.record_status(entry(status));
                }
                self.stamp(&mut entity);
                (Some(entity), Outcome::Created)
            }
            Some(entity) if entity.last_import_batch_id.as_deref() == Some(self.batch_id.as_str()) => {
                (None, Outcome::AlreadyApplied)
            }
            Some(mut entity) => {
                merge_attributes(&mut entity.attributes, &attributes, &self.policies);
                // A blank status says nothing about the entity's progress.
                let changed = match (&status, &entity.current_status) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(new), Some(current)) => !self.canonicalizer.same(current, new),
                };
                if changed {
                    if let Some(status) = status {
                        entity.record_status(entry(status));
                    }
                }
                self.stamp(&mut entity);
                let outcome = if changed { Outcome::Changed } else { Outcome::Unchanged };
                (Some(entity), outcome)
            }
        }
    }

    fn stamp(&self, entity: &mut EntityRecord) {
        entity.last_import_batch_id = Some(self.batch_id.clone());
        entity.last_snapshot_date = Some(
            entity
                .last_snapshot_date
                .map_or(self.snapshot_date, |d| d.max(self.snapshot_date)),
        );
        entity.updated_at = self.now;
    }

    async fn apply_chunk(self: Arc<Self>, records: Vec<ParsedRecord>) -> Result<ChunkTally, StoreError> {
        let items = records
            .into_iter()
            .map(|record| {
                let ctx = Arc::clone(&self);
                let id = record.entity_id.clone();
                (id, move |existing: Option<EntityRecord>| ctx.reconcile(record, existing))
            })
            .collect::<Vec<_>>();
        let outcomes = self.entities.upsert_chunk(items).await?;

        let mut tally = ChunkTally::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Created => tally.new_entities += 1,
                Outcome::AlreadyApplied => tally.already_applied += 1,
                Outcome::Unchanged => tally.unchanged += 1,
                Outcome::Changed => tally.status_changes += 1,
            }
        }
        Ok(tally)
    }
}

pub struct ReconciliationEngine {
    entities: Arc<EntityStore>,
    ledger: Arc<ImportLedger>,
    policies: Arc<FieldPolicies>,
    canonicalizer: StatusCanonicalizer,
    options: ApplyOptions,
}

impl ReconciliationEngine {
    pub fn new(entities: Arc<EntityStore>, ledger: Arc<ImportLedger>) -> Self {
        Self {
            entities,
            ledger,
            policies: Arc::new(FieldPolicies::default()),
            canonicalizer: StatusCanonicalizer::default(),
            options: ApplyOptions::default(),
        }
    }

    pub fn with_field_policies(mut self, policies: FieldPolicies) -> Self {
        self.policies = Arc::new(policies);
        self
    }

    pub fn with_canonicalizer(mut self, canonicalizer: StatusCanonicalizer) -> Self {
        self.canonicalizer = canonicalizer;
        self
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> ApplyOptions {
        self.options
    }

    pub fn entities(&self) -> &Arc<EntityStore> {
        &self.entities
    }

    pub fn ledger(&self) -> &Arc<ImportLedger> {
        &self.ledger
    }

    /// Applies `records` as the snapshot `file_name` taken on `snapshot_date`,
    /// using the engine's default options.
    pub async fn apply_snapshot(
        &self,
        records: Vec<ParsedRecord>,
        file_name: &str,
        snapshot_date: NaiveDate,
    ) -> Result<ImportBatch, ReconcileError> {
        self.apply(SnapshotInput::new(file_name, snapshot_date, records), self.options)
            .await
    }

    /// Parses raw snapshot bytes and applies the result.
    pub async fn import_bytes(
        &self,
        parser: &SnapshotParser,
        file_name: &str,
        bytes: &[u8],
        snapshot_date: NaiveDate,
        options: ApplyOptions,
    ) -> Result<ImportBatch, ReconcileError> {
        let parsed = parser.parse(bytes)?;
        for rejection in &parsed.rejections {
            debug!(file_name, %rejection, "row rejected");
        }
        let input = SnapshotInput::new(file_name, snapshot_date, parsed.records)
            .with_report(parsed.report)
            .with_content_hash(sha256_hex(bytes));
        self.apply(input, options).await
    }

    pub async fn apply(&self, input: SnapshotInput, options: ApplyOptions) -> Result<ImportBatch, ReconcileError> {
        let started = Utc::now();
        let SnapshotInput {
            file_name,
            snapshot_date,
            records,
            report,
            content_hash,
        } = input;

        let completed = self.ledger.completed_for_file(&file_name).await?;
        if let Some(done) = &completed {
            if !options.force {
                return Err(ReconcileError::DuplicateImport {
                    file_name,
                    batch_id: done.batch_id.clone(),
                });
            }
        }

        let mut batch = ImportBatch::new_pending(file_name.as_str(), snapshot_date, started);
        batch.forced = options.force && completed.is_some();
        batch.content_hash = content_hash;
        batch.total_records = report
            .as_ref()
            .map_or(records.len() as u64, |r| r.total_rows);
        if let Some(report) = &report {
            batch.skipped_records = report.malformed_rows;
            batch.invalid_records = report.field_shift_rows;
            batch.validation_rate = report.validation_rate();
            batch.degraded = report.is_degraded();
        }

        match self.ledger.pending_for_file(&file_name).await? {
            Some(pending) if pending.snapshot_date == snapshot_date => {
                info!(batch_id = %pending.batch_id, file_name = %file_name, "resuming pending import batch");
                batch.batch_id = pending.batch_id;
                batch.imported_at = pending.imported_at;
            }
            Some(mut stale) => {
                warn!(
                    batch_id = %stale.batch_id,
                    file_name = %file_name,
                    pending_date = %stale.snapshot_date,
                    "abandoning pending batch recorded under a different snapshot date"
                );
                stale.fail(started, format!("superseded by an import dated {snapshot_date}"));
                self.ledger.update_batch_status(&stale).await?;
                self.ledger.record_batch(&batch).await?;
            }
            None => self.ledger.record_batch(&batch).await?,
        }

        // Each entity is touched at most once per snapshot; the last row wins.
        let mut latest: BTreeMap<String, ParsedRecord> = BTreeMap::new();
        for record in records {
            if latest.insert(record.entity_id.clone(), record).is_some() {
                batch.duplicate_rows += 1;
            }
        }

        // One chunk is one backend batch write, so a failed chunk never leaves a committed prefix behind.
        let chunk_size = options.write_batch_size.max(1).min(self.entities.max_chunk_size());
        if chunk_size < options.write_batch_size {
            debug!(
                requested = options.write_batch_size,
                chunk_size, "write batch size capped at the backend batch limit"
            );
        }
        let ids: Vec<String> = latest.keys().cloned().collect();
        match self.check_ordering(&batch, &ids, chunk_size).await {
            Ok(()) => {}
            Err(err @ ReconcileError::OutOfOrderImport { .. }) => {
                warn!(batch_id = %batch.batch_id, error = %err, "rejecting out-of-order snapshot");
                batch.fail(Utc::now(), err.to_string());
                self.ledger.update_batch_status(&batch).await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        info!(
            batch_id = %batch.batch_id,
            file_name = %file_name,
            snapshot_date = %snapshot_date,
            entities = latest.len(),
            duplicate_rows = batch.duplicate_rows,
            "applying snapshot"
        );

        let ctx = Arc::new(ChunkContext {
            entities: Arc::clone(&self.entities),
            policies: Arc::clone(&self.policies),
            canonicalizer: self.canonicalizer.clone(),
            batch_id: batch.batch_id.clone(),
            file_name: file_name.clone(),
            snapshot_date,
            now: started,
        });

        let mut chunks: Vec<Vec<ParsedRecord>> = Vec::new();
        let mut current = Vec::with_capacity(chunk_size.min(latest.len()));
        for record in latest.into_values() {
            current.push(record);
            if current.len() == chunk_size {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let max_in_flight = options.max_in_flight.max(1);
        let mut in_flight = JoinSet::new();
        let mut failures: Vec<StoreError> = Vec::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            while in_flight.len() >= max_in_flight {
                if let Some(joined) = in_flight.join_next().await {
                    absorb(&mut batch, joined, &mut failures);
                }
            }
            let ctx = Arc::clone(&ctx);
            in_flight.spawn(async move {
                let size = chunk.len() as u64;
                let first_id = chunk.first().map(|r| r.entity_id.clone()).unwrap_or_default();
                let last_id = chunk.last().map(|r| r.entity_id.clone()).unwrap_or_default();
                let result = ctx.apply_chunk(chunk).await;
                ChunkResult {
                    index,
                    size,
                    first_id,
                    last_id,
                    result,
                }
            });
        }
        while let Some(joined) = in_flight.join_next().await {
            absorb(&mut batch, joined, &mut failures);
        }

        batch.finish(Utc::now());
        self.ledger.update_batch_status(&batch).await?;
        info!(
            batch_id = %batch.batch_id,
            status = batch.status.as_str(),
            new_entities = batch.new_entities,
            status_changes = batch.status_change_count,
            unchanged = batch.unchanged_count,
            already_applied = batch.already_applied,
            skipped = batch.skipped_records,
            invalid = batch.invalid_records,
            failed = batch.failed_records,
            "import batch finished"
        );

        let failed_chunks = failures.len();
        match failures.into_iter().next() {
            Some(source) => Err(ReconcileError::StoreWrite {
                batch_id: batch.batch_id,
                failed_chunks,
                failed_records: batch.failed_records,
                source,
            }),
            None => Ok(batch),
        }
    }

    /// Rejects the snapshot when any touched entity already carries a newer
    /// snapshot date. Entities stamped by this same batch (a resumed run) are exempt.
    async fn check_ordering(&self, batch: &ImportBatch, ids: &[String], page: usize) -> Result<(), ReconcileError> {
        for slice in ids.chunks(page) {
            let existing = self.entities.get_many(slice).await?;
            for id in slice {
                let Some(entity) = existing.get(id) else {
                    continue;
                };
                if entity.last_import_batch_id.as_deref() == Some(batch.batch_id.as_str()) {
                    continue;
                }
                if let Some(recorded) = entity.latest_recorded_date() {
                    if recorded > batch.snapshot_date {
                        return Err(ReconcileError::OutOfOrderImport {
                            file_name: batch.file_name.clone(),
                            batch_id: batch.batch_id.clone(),
                            snapshot_date: batch.snapshot_date,
                            entity_id: id.clone(),
                            recorded,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Rebuild mode: applies snapshots oldest first. Files that already have a
    /// completed batch are reported as skipped unless `options.force` is set.
    pub async fn replay(
        &self,
        mut inputs: Vec<SnapshotInput>,
        options: ApplyOptions,
    ) -> Result<ReplaySummary, ReconcileError> {
        inputs.sort_by(|a, b| {
            (a.snapshot_date, a.file_name.as_str()).cmp(&(b.snapshot_date, b.file_name.as_str()))
        });
        let mut summary = ReplaySummary::default();
        for input in inputs {
            match self.apply(input, options).await {
                Ok(batch) => summary.applied.push(batch),
                Err(ReconcileError::DuplicateImport { file_name, .. }) => {
                    info!(file_name = %file_name, "replay skipped already imported file");
                    summary.skipped.push(file_name);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(summary)
    }
}

fn absorb(batch: &mut ImportBatch, joined: Result<ChunkResult, JoinError>, failures: &mut Vec<StoreError>) {
    match joined {
        Ok(ChunkResult {
            result: Ok(tally), ..
        }) => {
            batch.new_entities += tally.new_entities;
            batch.status_change_count += tally.status_changes;
            batch.unchanged_count += tally.unchanged;
            batch.already_applied += tally.already_applied;
        }
        Ok(ChunkResult {
            index,
            size,
            first_id,
            last_id,
            result: Err(err),
        }) => {
            warn!(batch_id = %batch.batch_id, chunk = index, records = size, error = %err, "chunk aborted");
            batch.failed_records += size;
            batch
                .error_detail
                .push(format!("chunk {index} ({first_id}..={last_id}, {size} records): {err}"));
            failures.push(err);
        }
        Err(join_err) => {
            warn!(batch_id = %batch.batch_id, error = %join_err, "chunk task did not complete");
            batch.error_detail.push(format!("chunk task did not complete: {join_err}"));
            failures.push(StoreError::Backend(anyhow::Error::msg(join_err.to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(batch_id: &str, date: &str) -> ChunkContext {
        let documents = Arc::new(onemap_storage::MemoryDocumentStore::new());
        ChunkContext {
            entities: Arc::new(EntityStore::new(documents)),
            policies: Arc::new(FieldPolicies::default()),
            canonicalizer: StatusCanonicalizer::Exact,
            batch_id: batch_id.to_string(),
            file_name: format!("{batch_id}.csv"),
            snapshot_date: date.parse().expect("date"),
            now: Utc::now(),
        }
    }

    #[test]
    fn blank_status_creates_entity_without_history() {
        let (entity, outcome) = ctx("b1", "2025-07-01").reconcile(ParsedRecord::new("P1", None), None);
        let entity = entity.expect("created");
        assert_eq!(outcome, Outcome::Created);
        assert!(entity.status_history.is_empty());
        assert_eq!(entity.current_status, None);
        assert_eq!(entity.last_import_batch_id.as_deref(), Some("b1"));
    }

    #[test]
    fn first_status_on_a_bare_entity_is_a_change() {
        let (bare, _) = ctx("b1", "2025-07-01").reconcile(ParsedRecord::new("P1", None), None);
        let (entity, outcome) =
            ctx("b2", "2025-07-02").reconcile(ParsedRecord::new("P1", Some("Pole Permission: Pending")), bare);
        assert_eq!(outcome, Outcome::Changed);
        assert_eq!(entity.expect("entity").status_history.len(), 1);
    }

    #[test]
    fn blank_status_never_erases_history() {
        let (first, _) = ctx("b1", "2025-07-01").reconcile(ParsedRecord::new("P1", Some("A")), None);
        let (entity, outcome) = ctx("b2", "2025-07-02").reconcile(
            ParsedRecord::new("P1", None).with_attribute("address", "12 Main"),
            first,
        );
        let entity = entity.expect("entity");
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(entity.current_status.as_deref(), Some("A"));
        assert_eq!(entity.attributes.get("address").map(String::as_str), Some("12 Main"));
        assert_eq!(entity.last_snapshot_date, "2025-07-02".parse().ok());
    }

    #[test]
    fn same_batch_is_a_no_op() {
        let context = ctx("b1", "2025-07-01");
        let (first, _) = context.reconcile(ParsedRecord::new("P1", Some("A")), None);
        let (again, outcome) = context.reconcile(ParsedRecord::new("P1", Some("B")), first);
        assert!(again.is_none());
        assert_eq!(outcome, Outcome::AlreadyApplied);
    }

    #[test]
    fn canonicalized_statuses_do_not_count_as_changes() {
        let mut context = ctx("b2", "2025-07-02");
        context.canonicalizer = StatusCanonicalizer::TrimCaseFold;
        let (first, _) = ctx("b1", "2025-07-01").reconcile(ParsedRecord::new("P1", Some("Approved")), None);
        let (entity, outcome) = context.reconcile(ParsedRecord::new("P1", Some("APPROVED")), first);
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(entity.expect("entity").current_status.as_deref(), Some("Approved"));
    }

    #[test]
    fn agent_is_kept_on_history_and_attributes() {
        let mut record = ParsedRecord::new("P1", Some("Pole Permission: Approved"));
        record.agent = Some("Thabo Mokoena".to_string());
        let (entity, _) = ctx("b1", "2025-07-01").reconcile(record, None);
        let entity = entity.expect("entity");
        assert_eq!(entity.status_history[0].agent.as_deref(), Some("Thabo Mokoena"));
        assert_eq!(entity.attributes.get(AGENT).map(String::as_str), Some("Thabo Mokoena"));
    }
}
