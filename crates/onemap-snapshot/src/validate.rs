//! Field-shift detection: values that only make sense if a row's cells slid
//! into the wrong columns (text in coordinates, dates in pole numbers,
//! contract wording in addresses).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::ParserConfig;
use crate::{SnapshotError, ADDRESS, DROP_NUMBER, LATITUDE, LONGITUDE, POLE_NUMBER, STATUS};

const MAX_COORDINATE_LEN: usize = 20;
const MAX_ADDRESS_LEN: usize = 200;

static WORD_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]{5,}").expect("valid regex"));
static DATE_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}[-/]\d{2}[-/]\d{2}|^\d{2}:\d{2}").expect("valid regex"));
static GPS_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+\.\d{10,}").expect("valid regex"));
static LEGAL_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)and prior to the transfer|shall also notify|terms and conditions|hereby consent")
        .expect("valid regex")
});

#[derive(Debug, Clone)]
pub struct FieldValidator {
    identifier_patterns: BTreeMap<String, Regex>,
}

impl FieldValidator {
    pub fn from_config(config: &ParserConfig) -> Result<Self, SnapshotError> {
        let mut identifier_patterns = BTreeMap::new();
        for (field, pattern) in &config.identifier_patterns {
            let regex = Regex::new(pattern).map_err(|source| SnapshotError::InvalidPattern {
                field: field.clone(),
                source,
            })?;
            identifier_patterns.insert(field.clone(), regex);
        }
        Ok(Self { identifier_patterns })
    }

    fn is_identifier(&self, field: &str) -> bool {
        field == POLE_NUMBER || field == DROP_NUMBER || self.identifier_patterns.contains_key(field)
    }

    /// First suspicious `(field, value, reason)` among the canonical fields of
    /// one row. Callers pass only present values.
    pub fn check<'a, I>(&self, fields: I) -> Option<(&'a str, &'a str, String)>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        fields.into_iter().find_map(|(field, value)| {
            self.check_value(field, value)
                .map(|reason| (field, value, reason))
        })
    }

    pub fn check_value(&self, field: &str, value: &str) -> Option<String> {
        match field {
            LATITUDE => check_coordinate(value, 90.0),
            LONGITUDE => check_coordinate(value, 180.0),
            ADDRESS => check_address(value),
            STATUS => LEGAL_TEXT
                .is_match(value)
                .then(|| "status contains contract wording".to_string()),
            f if self.is_identifier(f) => self.check_identifier(f, value),
            _ => None,
        }
    }

    fn check_identifier(&self, field: &str, value: &str) -> Option<String> {
        if DATE_LIKE.is_match(value) {
            return Some("identifier looks like a date or time".to_string());
        }
        match self.identifier_patterns.get(field) {
            Some(pattern) if !pattern.is_match(value) => {
                Some(format!("identifier does not match /{}/", pattern.as_str()))
            }
            _ => None,
        }
    }
}

fn check_coordinate(value: &str, limit: f64) -> Option<String> {
    if value.chars().count() > MAX_COORDINATE_LEN || WORD_RUN.is_match(value) {
        return Some("text in coordinate field".to_string());
    }
    let Ok(number) = value.parse::<f64>() else {
        return Some("coordinate is not numeric".to_string());
    };
    if !number.is_finite() {
        return Some("coordinate is not numeric".to_string());
    }
    if number.abs() > limit {
        return Some(format!("coordinate {number} outside ±{limit}"));
    }
    None
}

fn check_address(value: &str) -> Option<String> {
    if value.chars().count() > MAX_ADDRESS_LEN {
        return Some(format!("address longer than {MAX_ADDRESS_LEN} characters"));
    }
    if GPS_DECIMAL.is_match(value) {
        return Some("address contains a GPS decimal".to_string());
    }
    if LEGAL_TEXT.is_match(value) {
        return Some("address contains contract wording".to_string());
    }
    None
}
