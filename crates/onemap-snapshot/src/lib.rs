//! Snapshot Parser: delimited OneMap exports -> normalized [`ParsedRecord`]s.
//!
//! Row-level problems never fail a parse. Rows with the wrong shape or no
//! entity id are skipped as [`MalformedRecordError`]s; rows whose values look
//! like they slid into neighbouring columns are excluded as
//! [`FieldShiftValidationError`]s. Only header-level problems surface as
//! [`SnapshotError`].

pub mod config;
pub mod date;
pub mod parser;
pub mod validate;

use serde::Serialize;
use thiserror::Error;

pub use config::{Delimiter, ParserConfig, DEFAULT_POLE_PATTERN};
pub use date::extract_snapshot_date;
pub use onemap_core::ParsedRecord;
pub use parser::{ParsedSnapshot, SnapshotParser, SnapshotRows};
pub use validate::FieldValidator;

pub const CRATE_NAME: &str = "onemap-snapshot";

pub const ENTITY_ID: &str = "entity_id";
pub const STATUS: &str = "status";
pub const AGENT: &str = "agent";
pub const LATITUDE: &str = "latitude";
pub const LONGITUDE: &str = "longitude";
pub const POLE_NUMBER: &str = "pole_number";
pub const DROP_NUMBER: &str = "drop_number";
pub const ADDRESS: &str = "address";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is empty")]
    Empty,
    #[error("reading snapshot header: {0}")]
    Header(#[source] csv::Error),
    #[error("no header column maps to entity_id (configured sources: {sources:?})")]
    MissingEntityColumn { sources: Vec<String> },
    #[error("invalid identifier pattern for '{field}': {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecordError {
    #[error("line {line_number}: expected {expected} columns, found {found}")]
    ColumnCount {
        line_number: u64,
        expected: usize,
        found: usize,
    },
    #[error("line {line_number}: entity id is blank")]
    MissingEntityId { line_number: u64 },
    #[error("line {line_number}: unreadable row: {message}")]
    Unreadable { line_number: u64, message: String },
}

impl MalformedRecordError {
    pub fn line_number(&self) -> u64 {
        match self {
            Self::ColumnCount { line_number, .. }
            | Self::MissingEntityId { line_number }
            | Self::Unreadable { line_number, .. } => *line_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line_number}: entity {entity_id} field '{field}' looks shifted ({reason}): {value:?}")]
pub struct FieldShiftValidationError {
    pub line_number: u64,
    pub entity_id: String,
    pub field: String,
    /// Offending value, cut to 50 characters.
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error(transparent)]
    Malformed(#[from] MalformedRecordError),
    #[error(transparent)]
    FieldShift(#[from] FieldShiftValidationError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub total_rows: u64,
    pub valid_rows: u64,
    pub malformed_rows: u64,
    pub field_shift_rows: u64,
}

impl ValidationReport {
    /// `valid / (valid + field_shift)`; malformed rows never reached validation.
    pub fn validation_rate(&self) -> f64 {
        let validated = self.valid_rows + self.field_shift_rows;
        if validated == 0 {
            1.0
        } else {
            self.valid_rows as f64 / validated as f64
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.field_shift_rows > 0
    }

    fn record(&mut self, outcome: &Result<ParsedRecord, RowRejection>) {
        self.total_rows += 1;
        match outcome {
            Ok(_) => self.valid_rows += 1,
            Err(RowRejection::Malformed(_)) => self.malformed_rows += 1,
            Err(RowRejection::FieldShift(_)) => self.field_shift_rows += 1,
        }
    }
}
