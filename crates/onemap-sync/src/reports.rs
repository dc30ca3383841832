//! Read-only diagnostics over the Entity Store and Import Ledger.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use onemap_core::{EntityRecord, HistoryEntry, ImportBatch};
use onemap_snapshot::{ADDRESS, DROP_NUMBER, LATITUDE, LONGITUDE, POLE_NUMBER};
use onemap_storage::{EntityStore, ImportLedger, StoreError};
use serde::Serialize;
use strsim::jaro_winkler;

pub const DEFAULT_ADDRESS_THRESHOLD: f64 = 0.92;
/// Physical limit of drops served from one pole.
pub const MAX_DROPS_PER_POLE: usize = 12;
/// Poles at or above this many drops are flagged before they hit the limit.
pub const NEAR_CAPACITY_DROPS: usize = MAX_DROPS_PER_POLE - 2;
const SCAN_PAGE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RevertSeverity {
    pub fn from_levels_back(levels: u32) -> Self {
        match levels {
            0 | 1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransitionKind {
    Normal,
    Bypassed { levels_forward: u32 },
    Revert { levels_back: u32, severity: RevertSeverity },
    /// One side has no configured level.
    Unknown,
}

impl TransitionKind {
    pub fn label(&self) -> String {
        match self {
            Self::Normal => "normal".to_string(),
            Self::Bypassed { levels_forward } => format!("bypassed (+{levels_forward})"),
            Self::Revert { levels_back, severity } => format!("revert (-{levels_back}, {})", severity.as_str()),
            Self::Unknown => "unknown".to_string(),
        }
    }
}

/// Workflow level per status string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusProgression {
    levels: BTreeMap<String, u32>,
}

impl StatusProgression {
    pub fn new(levels: BTreeMap<String, u32>) -> Self {
        Self { levels }
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, status: &str) -> Option<u32> {
        self.levels.get(status.trim()).copied()
    }

    pub fn classify(&self, from: &str, to: &str) -> TransitionKind {
        let (Some(a), Some(b)) = (self.level(from), self.level(to)) else {
            return TransitionKind::Unknown;
        };
        if b < a {
            let levels_back = a - b;
            return TransitionKind::Revert {
                levels_back,
                severity: RevertSeverity::from_levels_back(levels_back),
            };
        }
        let forward = b - a;
        // A declined step cannot be followed by progress without a new application.
        if forward > 1 || (forward > 0 && from.contains("Declined")) {
            TransitionKind::Bypassed { levels_forward: forward }
        } else {
            TransitionKind::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub source_file: String,
    pub kind: TransitionKind,
}

fn transitions(history: &[HistoryEntry], progression: &StatusProgression) -> Vec<Transition> {
    history
        .windows(2)
        .map(|pair| Transition {
            from: pair[0].status.clone(),
            to: pair[1].status.clone(),
            from_date: pair[0].snapshot_date,
            to_date: pair[1].snapshot_date,
            source_file: pair[1].source_file.clone(),
            kind: progression.classify(&pair[0].status, &pair[1].status),
        })
        .collect()
}

// Status distribution

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusShare {
    pub status: String,
    pub count: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusDistribution {
    pub total: u64,
    pub without_status: u64,
    pub statuses: Vec<StatusShare>,
}

pub async fn status_distribution(entities: &EntityStore) -> Result<StatusDistribution, StoreError> {
    let counts = entities.count_by_status().await?;
    let percent = |count: u64| {
        if counts.total == 0 {
            0.0
        } else {
            count as f64 * 100.0 / counts.total as f64
        }
    };
    let mut statuses: Vec<StatusShare> = counts
        .by_status
        .iter()
        .map(|(status, count)| StatusShare {
            status: status.clone(),
            count: *count,
            percent: percent(*count),
        })
        .collect();
    statuses.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.status.cmp(&b.status)));
    Ok(StatusDistribution {
        total: counts.total,
        without_status: counts.without_status,
        statuses,
    })
}

impl StatusDistribution {
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Status Distribution".to_string(),
            String::new(),
            format!("- entities: {}", self.total),
            format!("- without status: {}", self.without_status),
            String::new(),
            "| Status | Count | Share |".to_string(),
            "|---|---:|---:|".to_string(),
        ];
        for share in &self.statuses {
            lines.push(format!("| {} | {} | {:.1}% |", share.status, share.count, share.percent));
        }
        lines.join("\n")
    }
}

// Duplicates

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedPole {
    pub pole_number: String,
    pub entity_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarAddress {
    pub gps_bucket: String,
    pub left_id: String,
    pub right_id: String,
    pub left_address: String,
    pub right_address: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DuplicateReport {
    pub scanned: u64,
    pub shared_poles: Vec<SharedPole>,
    pub similar_addresses: Vec<SimilarAddress>,
}

pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `lat:lon` rounded to four decimals (about 11 m).
fn gps_bucket(entity: &EntityRecord) -> Option<String> {
    let lat: f64 = entity.attributes.get(LATITUDE)?.trim().parse().ok()?;
    let lon: f64 = entity.attributes.get(LONGITUDE)?.trim().parse().ok()?;
    Some(format!("{lat:.4}:{lon:.4}"))
}

pub async fn find_duplicates(entities: &EntityStore, threshold: f64) -> Result<DuplicateReport, StoreError> {
    let mut report = DuplicateReport::default();
    let mut poles: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut buckets: BTreeMap<String, Vec<(String, String, String)>> = BTreeMap::new();

    let mut scan = entities.scan(SCAN_PAGE);
    while let Some(page) = scan.next_page().await? {
        for entity in page {
            report.scanned += 1;
            if let Some(pole) = entity.attributes.get(POLE_NUMBER).map(|p| p.trim()).filter(|p| !p.is_empty()) {
                poles.entry(pole.to_string()).or_default().push(entity.entity_id.clone());
            }
            let Some(address) = entity.attributes.get(ADDRESS) else {
                continue;
            };
            let normalized = normalize_key_fragment(address);
            if normalized.is_empty() {
                continue;
            }
            if let Some(bucket) = gps_bucket(&entity) {
                buckets
                    .entry(bucket)
                    .or_default()
                    .push((entity.entity_id.clone(), address.clone(), normalized));
            }
        }
    }

    report.shared_poles = poles
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(pole_number, entity_ids)| SharedPole {
            pole_number,
            entity_ids,
        })
        .collect();

    for (bucket, members) in buckets {
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                let score = jaro_winkler(&members[i].2, &members[j].2);
                if score >= threshold {
                    report.similar_addresses.push(SimilarAddress {
                        gps_bucket: bucket.clone(),
                        left_id: members[i].0.clone(),
                        right_id: members[j].0.clone(),
                        left_address: members[i].1.clone(),
                        right_address: members[j].1.clone(),
                        score,
                    });
                }
            }
        }
    }
    Ok(report)
}

impl DuplicateReport {
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Duplicate Candidates".to_string(),
            String::new(),
            format!("- entities scanned: {}", self.scanned),
            format!("- shared pole numbers: {}", self.shared_poles.len()),
            format!("- similar addresses: {}", self.similar_addresses.len()),
        ];
        if !self.shared_poles.is_empty() {
            lines.push(String::new());
            lines.push("## Shared Pole Numbers".to_string());
            for pole in &self.shared_poles {
                lines.push(format!("- `{}`: {}", pole.pole_number, pole.entity_ids.join(", ")));
            }
        }
        if !self.similar_addresses.is_empty() {
            lines.push(String::new());
            lines.push("## Similar Addresses".to_string());
            for pair in &self.similar_addresses {
                lines.push(format!(
                    "- {} / {} ({:.3}, bucket {}): \"{}\" vs \"{}\"",
                    pair.left_id, pair.right_id, pair.score, pair.gps_bucket, pair.left_address, pair.right_address
                ));
            }
        }
        lines.join("\n")
    }
}

// Pole/drop integrity

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoleLoad {
    pub pole_number: String,
    pub drop_count: usize,
    pub drops: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedDrop {
    pub drop_number: String,
    pub pole_numbers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoleDropReport {
    pub scanned: u64,
    pub with_pole_and_drop: u64,
    pub unique_poles: usize,
    pub unique_drops: usize,
    pub average_drops_per_pole: f64,
    /// More than `MAX_DROPS_PER_POLE` drops.
    pub over_capacity: Vec<PoleLoad>,
    pub at_capacity: Vec<PoleLoad>,
    pub near_capacity: Vec<PoleLoad>,
    pub shared_drops: Vec<SharedDrop>,
}

fn drop_reference(entity: &EntityRecord) -> Option<(&str, &str)> {
    let pole = entity.attributes.get(POLE_NUMBER)?.trim();
    let drop = entity.attributes.get(DROP_NUMBER)?.trim();
    if pole.is_empty() || drop.is_empty() || drop.to_ascii_lowercase().contains("no drop") {
        return None;
    }
    Some((pole, drop))
}

/// Checks the two wiring rules: a pole serves at most `MAX_DROPS_PER_POLE`
/// drops and a drop hangs off exactly one pole.
pub async fn pole_drop_integrity(entities: &EntityStore) -> Result<PoleDropReport, StoreError> {
    let mut report = PoleDropReport::default();
    let mut pole_drops: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut drop_poles: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    let mut scan = entities.scan(SCAN_PAGE);
    while let Some(page) = scan.next_page().await? {
        for entity in page {
            report.scanned += 1;
            let Some((pole, drop)) = drop_reference(&entity) else {
                continue;
            };
            report.with_pole_and_drop += 1;
            pole_drops.entry(pole.to_string()).or_default().insert(drop.to_string());
            drop_poles.entry(drop.to_string()).or_default().insert(pole.to_string());
        }
    }

    report.unique_poles = pole_drops.len();
    report.unique_drops = drop_poles.len();
    if !pole_drops.is_empty() {
        let assigned: usize = pole_drops.values().map(BTreeSet::len).sum();
        report.average_drops_per_pole = assigned as f64 / pole_drops.len() as f64;
    }

    for (pole_number, drops) in pole_drops {
        let load = PoleLoad {
            pole_number,
            drop_count: drops.len(),
            drops: drops.into_iter().collect(),
        };
        match load.drop_count {
            n if n > MAX_DROPS_PER_POLE => report.over_capacity.push(load),
            MAX_DROPS_PER_POLE => report.at_capacity.push(load),
            n if n >= NEAR_CAPACITY_DROPS => report.near_capacity.push(load),
            _ => {}
        }
    }
    report
        .over_capacity
        .sort_by(|a, b| b.drop_count.cmp(&a.drop_count).then_with(|| a.pole_number.cmp(&b.pole_number)));

    report.shared_drops = drop_poles
        .into_iter()
        .filter(|(_, poles)| poles.len() > 1)
        .map(|(drop_number, poles)| SharedDrop {
            drop_number,
            pole_numbers: poles.into_iter().collect(),
        })
        .collect();
    Ok(report)
}

impl PoleDropReport {
    /// No pole over the limit and no drop on more than one pole.
    pub fn is_clean(&self) -> bool {
        self.over_capacity.is_empty() && self.shared_drops.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Pole/Drop Integrity".to_string(),
            String::new(),
            format!("- entities scanned: {}", self.scanned),
            format!("- with pole and drop: {}", self.with_pole_and_drop),
            format!("- unique poles: {}", self.unique_poles),
            format!("- unique drops: {}", self.unique_drops),
            format!("- average drops per pole: {:.2}", self.average_drops_per_pole),
            format!("- over capacity (>{MAX_DROPS_PER_POLE}): {}", self.over_capacity.len()),
            format!("- at capacity ({MAX_DROPS_PER_POLE}): {}", self.at_capacity.len()),
            format!("- near capacity: {}", self.near_capacity.len()),
            format!("- drops on several poles: {}", self.shared_drops.len()),
        ];
        for (title, loads) in [
            ("Over Capacity", &self.over_capacity),
            ("At Capacity", &self.at_capacity),
            ("Near Capacity", &self.near_capacity),
        ] {
            if loads.is_empty() {
                continue;
            }
            lines.push(String::new());
            lines.push(format!("## {title}"));
            for load in loads {
                lines.push(format!(
                    "- `{}`: {}/{MAX_DROPS_PER_POLE} drops ({})",
                    load.pole_number,
                    load.drop_count,
                    load.drops.join(", ")
                ));
            }
        }
        if !self.shared_drops.is_empty() {
            lines.push(String::new());
            lines.push("## Drops On Several Poles".to_string());
            for shared in &self.shared_drops {
                lines.push(format!("- `{}`: {}", shared.drop_number, shared.pole_numbers.join(", ")));
            }
        }
        lines.join("\n")
    }
}

// History inspection

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityHistoryReport {
    pub entity_id: String,
    pub current_status: Option<String>,
    pub last_import_batch_id: Option<String>,
    pub entries: Vec<HistoryEntry>,
    pub transitions: Vec<Transition>,
    pub violations: Vec<String>,
}

pub async fn entity_history(
    entities: &EntityStore,
    entity_id: &str,
    progression: &StatusProgression,
) -> Result<Option<EntityHistoryReport>, StoreError> {
    let Some(entity) = entities.get(entity_id).await? else {
        return Ok(None);
    };
    Ok(Some(EntityHistoryReport {
        transitions: transitions(&entity.status_history, progression),
        violations: entity.invariant_violations(),
        entity_id: entity.entity_id,
        current_status: entity.current_status,
        last_import_batch_id: entity.last_import_batch_id,
        entries: entity.status_history,
    }))
}

impl EntityHistoryReport {
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            format!("# Entity `{}`", self.entity_id),
            String::new(),
            format!("- current status: {}", self.current_status.as_deref().unwrap_or("(none)")),
            format!("- last batch: {}", self.last_import_batch_id.as_deref().unwrap_or("(none)")),
            String::new(),
            "| Date | Status | Agent | File |".to_string(),
            "|---|---|---|---|".to_string(),
        ];
        for entry in &self.entries {
            lines.push(format!(
                "| {} | {} | {} | {} |",
                entry.snapshot_date,
                entry.status,
                entry.agent.as_deref().unwrap_or(""),
                entry.source_file
            ));
        }
        if !self.transitions.is_empty() {
            lines.push(String::new());
            lines.push("## Transitions".to_string());
            for t in &self.transitions {
                lines.push(format!("- {} {} -> {}: {}", t.to_date, t.from, t.to, t.kind.label()));
            }
        }
        if !self.violations.is_empty() {
            lines.push(String::new());
            lines.push("## Invariant Violations".to_string());
            lines.extend(self.violations.iter().map(|v| format!("- {v}")));
        }
        lines.join("\n")
    }
}

// Revert analysis

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionFinding {
    pub entity_id: String,
    pub transition: Transition,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RevertReport {
    pub scanned: u64,
    pub transitions: u64,
    pub normal: u64,
    pub bypassed: Vec<TransitionFinding>,
    pub reverts: Vec<TransitionFinding>,
    /// Statuses seen in history with no configured level, with occurrence counts.
    pub unknown_statuses: BTreeMap<String, u64>,
}

impl RevertReport {
    pub fn by_severity(&self) -> BTreeMap<RevertSeverity, u64> {
        let mut out = BTreeMap::new();
        for finding in &self.reverts {
            if let TransitionKind::Revert { severity, .. } = finding.transition.kind {
                *out.entry(severity).or_default() += 1;
            }
        }
        out
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Status Revert Analysis".to_string(),
            String::new(),
            format!("- entities scanned: {}", self.scanned),
            format!("- transitions: {}", self.transitions),
            format!("- normal: {}", self.normal),
            format!("- bypassed: {}", self.bypassed.len()),
            format!("- reverts: {}", self.reverts.len()),
        ];
        for (severity, count) in self.by_severity().iter().rev() {
            lines.push(format!("  - {}: {count}", severity.as_str()));
        }
        for (title, findings) in [("Reverts", &self.reverts), ("Bypassed Steps", &self.bypassed)] {
            if findings.is_empty() {
                continue;
            }
            lines.push(String::new());
            lines.push(format!("## {title}"));
            for f in findings {
                lines.push(format!(
                    "- {} on {}: {} -> {} ({})",
                    f.entity_id,
                    f.transition.to_date,
                    f.transition.from,
                    f.transition.to,
                    f.transition.kind.label()
                ));
            }
        }
        if !self.unknown_statuses.is_empty() {
            lines.push(String::new());
            lines.push("## Statuses Without A Level".to_string());
            for (status, count) in &self.unknown_statuses {
                lines.push(format!("- {status}: {count}"));
            }
        }
        lines.join("\n")
    }
}

pub async fn revert_report(entities: &EntityStore, progression: &StatusProgression) -> Result<RevertReport, StoreError> {
    let mut report = RevertReport::default();
    let mut scan = entities.scan(SCAN_PAGE);
    while let Some(page) = scan.next_page().await? {
        for entity in page {
            report.scanned += 1;
            for entry in &entity.status_history {
                if progression.level(&entry.status).is_none() {
                    *report.unknown_statuses.entry(entry.status.clone()).or_default() += 1;
                }
            }
            for transition in transitions(&entity.status_history, progression) {
                report.transitions += 1;
                let finding = |transition| TransitionFinding {
                    entity_id: entity.entity_id.clone(),
                    transition,
                };
                match transition.kind {
                    TransitionKind::Normal => report.normal += 1,
                    TransitionKind::Bypassed { .. } => report.bypassed.push(finding(transition)),
                    TransitionKind::Revert { .. } => report.reverts.push(finding(transition)),
                    TransitionKind::Unknown => {}
                }
            }
        }
    }
    report
        .reverts
        .sort_by(|a, b| b.transition.kind.severity_rank().cmp(&a.transition.kind.severity_rank()));
    Ok(report)
}

impl TransitionKind {
    fn severity_rank(&self) -> Option<RevertSeverity> {
        match self {
            Self::Revert { severity, .. } => Some(*severity),
            _ => None,
        }
    }
}

// Ledger listing

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchListing {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub batches: Vec<ImportBatch>,
}

pub async fn batches_in_range(
    ledger: &ImportLedger,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<BatchListing, StoreError> {
    Ok(BatchListing {
        from,
        to,
        batches: ledger.in_date_range(from, to).await?,
    })
}

impl BatchListing {
    pub fn to_markdown(&self) -> String {
        let bound = |d: Option<NaiveDate>| d.map_or_else(|| "*".to_string(), |d| d.to_string());
        let mut lines = vec![
            format!("# Import Batches {} .. {}", bound(self.from), bound(self.to)),
            String::new(),
            "| Snapshot | File | Status | Records | New | Changed | Unchanged | Skipped | Invalid | Failed | Rate |".to_string(),
            "|---|---|---|---:|---:|---:|---:|---:|---:|---:|---:|".to_string(),
        ];
        for b in &self.batches {
            lines.push(format!(
                "| {} | {} | {}{} | {} | {} | {} | {} | {} | {} | {} | {:.1}% |",
                b.snapshot_date,
                b.file_name,
                b.status.as_str(),
                if b.degraded { " (degraded)" } else { "" },
                b.total_records,
                b.new_entities,
                b.status_change_count,
                b.unchanged_count,
                b.skipped_records,
                b.invalid_records,
                b.failed_records,
                b.validation_rate * 100.0
            ));
        }
        lines.join("\n")
    }
}
