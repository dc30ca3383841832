use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use onemap_core::ParsedRecord;
use tracing::debug;

use crate::config::ParserConfig;
use crate::validate::FieldValidator;
use crate::{
    FieldShiftValidationError, MalformedRecordError, RowRejection, SnapshotError, ValidationReport,
    AGENT, ENTITY_ID, STATUS,
};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const MAX_REPORTED_VALUE_CHARS: usize = 50;

fn strip_utf8_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(UTF8_BOM).unwrap_or(data)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Column {
    Canonical(String),
    Unmapped(String),
    Dropped,
}

#[derive(Debug, Clone)]
pub struct SnapshotParser {
    config: ParserConfig,
    validator: FieldValidator,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSnapshot {
    pub records: Vec<ParsedRecord>,
    pub rejections: Vec<RowRejection>,
    pub report: ValidationReport,
}

impl ParsedSnapshot {
    pub fn malformed(&self) -> impl Iterator<Item = &MalformedRecordError> {
        self.rejections.iter().filter_map(|r| match r {
            RowRejection::Malformed(err) => Some(err),
            RowRejection::FieldShift(_) => None,
        })
    }

    pub fn field_shifts(&self) -> impl Iterator<Item = &FieldShiftValidationError> {
        self.rejections.iter().filter_map(|r| match r {
            RowRejection::FieldShift(err) => Some(err),
            RowRejection::Malformed(_) => None,
        })
    }
}

impl SnapshotParser {
    pub fn new(config: ParserConfig) -> Result<Self, SnapshotError> {
        let validator = FieldValidator::from_config(&config)?;
        Ok(Self { config, validator })
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Lazy single pass over the data rows. Restart by calling `rows` again.
    pub fn rows<'a>(&'a self, data: &'a [u8]) -> Result<SnapshotRows<'a>, SnapshotError> {
        let data = strip_utf8_bom(data);
        if data.iter().all(u8::is_ascii_whitespace) {
            return Err(SnapshotError::Empty);
        }

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(self.config.delimiter.resolve(data))
            .from_reader(data);
        let headers = reader.headers().map_err(SnapshotError::Header)?.clone();

        let columns: Vec<Column> = headers
            .iter()
            .map(|header| match self.config.canonical_for(header) {
                Some(canonical) => Column::Canonical(canonical.to_string()),
                None if self.config.keep_unmapped && !header.trim().is_empty() => {
                    Column::Unmapped(header.trim().to_string())
                }
                None => Column::Dropped,
            })
            .collect();
        let entity_column = columns
            .iter()
            .position(|c| matches!(c, Column::Canonical(field) if field == ENTITY_ID))
            .ok_or_else(|| SnapshotError::MissingEntityColumn {
                sources: self
                    .config
                    .columns
                    .iter()
                    .filter(|(_, canonical)| canonical.as_str() == ENTITY_ID)
                    .map(|(source, _)| source.clone())
                    .collect(),
            })?;

        Ok(SnapshotRows {
            records: reader.into_records(),
            columns,
            entity_column,
            validator: &self.validator,
            report: ValidationReport::default(),
        })
    }

    pub fn parse(&self, data: &[u8]) -> Result<ParsedSnapshot, SnapshotError> {
        let mut rows = self.rows(data)?;
        let mut snapshot = ParsedSnapshot::default();
        for row in rows.by_ref() {
            match row {
                Ok(record) => snapshot.records.push(record),
                Err(rejection) => snapshot.rejections.push(rejection),
            }
        }
        snapshot.report = rows.into_report();
        debug!(
            total = snapshot.report.total_rows,
            valid = snapshot.report.valid_rows,
            malformed = snapshot.report.malformed_rows,
            field_shift = snapshot.report.field_shift_rows,
            "parsed snapshot"
        );
        Ok(snapshot)
    }
}

pub struct SnapshotRows<'a> {
    records: StringRecordsIntoIter<&'a [u8]>,
    columns: Vec<Column>,
    entity_column: usize,
    validator: &'a FieldValidator,
    report: ValidationReport,
}

impl SnapshotRows<'_> {
    /// Counts over the rows yielded so far.
    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn into_report(self) -> ValidationReport {
        self.report
    }

    fn convert(&self, record: &StringRecord) -> Result<ParsedRecord, RowRejection> {
        let line_number = record.position().map(|p| p.line()).unwrap_or_default();
        if record.len() != self.columns.len() {
            return Err(MalformedRecordError::ColumnCount {
                line_number,
                expected: self.columns.len(),
                found: record.len(),
            }
            .into());
        }
        let entity_id = record.get(self.entity_column).map(str::trim).unwrap_or_default();
        if entity_id.is_empty() {
            return Err(MalformedRecordError::MissingEntityId { line_number }.into());
        }

        let mut parsed = ParsedRecord::new(entity_id, None);
        parsed.line_number = line_number;
        let mut canonical: Vec<(&str, &str)> = Vec::new();
        for (column, cell) in self.columns.iter().zip(record.iter()) {
            let value = cell.trim();
            if value.is_empty() {
                continue;
            }
            match column {
                Column::Canonical(field) if field == ENTITY_ID => {}
                Column::Canonical(field) => canonical.push((field.as_str(), value)),
                Column::Unmapped(name) => {
                    parsed
                        .attributes
                        .entry(name.clone())
                        .or_insert_with(|| value.to_string());
                }
                Column::Dropped => {}
            }
        }

        if let Some((field, value, reason)) = self.validator.check(canonical.iter().copied()) {
            return Err(FieldShiftValidationError {
                line_number,
                entity_id: entity_id.to_string(),
                field: field.to_string(),
                value: value.chars().take(MAX_REPORTED_VALUE_CHARS).collect(),
                reason,
            }
            .into());
        }

        // Several source columns may feed one canonical field; the leftmost
        // present value wins.
        for (field, value) in canonical {
            match field {
                STATUS => {
                    parsed.status.get_or_insert_with(|| value.to_string());
                }
                AGENT => {
                    parsed.agent.get_or_insert_with(|| value.to_string());
                }
                _ => {
                    parsed
                        .attributes
                        .entry(field.to_string())
                        .or_insert_with(|| value.to_string());
                }
            }
        }
        Ok(parsed)
    }
}

impl Iterator for SnapshotRows<'_> {
    type Item = Result<ParsedRecord, RowRejection>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = match self.records.next()? {
            Ok(record) => self.convert(&record),
            Err(err) => Err(MalformedRecordError::Unreadable {
                line_number: err.position().map(|p| p.line()).unwrap_or_default(),
                message: err.to_string(),
            }
            .into()),
        };
        self.report.record(&item);
        Some(item)
    }
}
