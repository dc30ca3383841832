use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ADDRESS, AGENT, DROP_NUMBER, ENTITY_ID, LATITUDE, LONGITUDE, POLE_NUMBER, STATUS};

/// Default pole-number shape, e.g. `LAW.P.B167`.
pub const DEFAULT_POLE_PATTERN: &str = r"^[A-Z]{2,4}\.[A-Z]\.[A-Z0-9]+$";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    Comma,
    Semicolon,
    /// Sniffed from the header line; semicolon wins only when it outnumbers commas.
    #[default]
    Auto,
}

impl Delimiter {
    pub fn resolve(&self, data: &[u8]) -> u8 {
        match self {
            Self::Comma => b',',
            Self::Semicolon => b';',
            Self::Auto => sniff_delimiter(data),
        }
    }
}

fn sniff_delimiter(data: &[u8]) -> u8 {
    let header = data.split(|b| *b == b'\n').next().unwrap_or_default();
    let (mut commas, mut semicolons, mut quoted) = (0usize, 0usize, false);
    for byte in header {
        match byte {
            b'"' => quoted = !quoted,
            b',' if !quoted => commas += 1,
            b';' if !quoted => semicolons += 1,
            _ => {}
        }
    }
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

/// How one snapshot's columns become canonical fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Source column header -> canonical field name.
    pub columns: BTreeMap<String, String>,
    pub delimiter: Delimiter,
    /// Keep columns with no mapping as attributes under their header name.
    pub keep_unmapped: bool,
    /// Canonical identifier field -> regex its values must match.
    pub identifier_patterns: BTreeMap<String, String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        let columns = [
            ("Property ID", ENTITY_ID),
            ("Status", STATUS),
            ("Field Agent Name (pole permission)", AGENT),
            ("Latitude", LATITUDE),
            ("Longitude", LONGITUDE),
            ("Pole Number", POLE_NUMBER),
            ("Drop Number", DROP_NUMBER),
            ("Location Address", ADDRESS),
        ]
        .into_iter()
        .map(|(source, canonical)| (source.to_string(), canonical.to_string()))
        .collect();
        Self {
            columns,
            delimiter: Delimiter::Auto,
            keep_unmapped: false,
            identifier_patterns: BTreeMap::from([(
                POLE_NUMBER.to_string(),
                DEFAULT_POLE_PATTERN.to_string(),
            )]),
        }
    }
}

impl ParserConfig {
    pub fn with_column(mut self, source: &str, canonical: &str) -> Self {
        self.columns.insert(source.to_string(), canonical.to_string());
        self
    }

    pub fn with_delimiter(mut self, delimiter: Delimiter) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Canonical field for a header cell; header matching ignores surrounding
    /// whitespace and ASCII case.
    pub fn canonical_for(&self, header: &str) -> Option<&str> {
        let header = header.trim();
        self.columns
            .get(header)
            .or_else(|| {
                self.columns
                    .iter()
                    .find(|(source, _)| source.trim().eq_ignore_ascii_case(header))
                    .map(|(_, canonical)| canonical)
            })
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_delimiter_ignores_quoted_commas() {
        assert_eq!(Delimiter::Auto.resolve(b"Property ID;Status;Location Address\n1;A;\"1, Main\""), b';');
        assert_eq!(Delimiter::Auto.resolve(b"Property ID,Status\n1,A"), b',');
        assert_eq!(Delimiter::Auto.resolve(b"\"a;b\",c\n"), b',');
        assert_eq!(Delimiter::Semicolon.resolve(b"a,b,c"), b';');
    }

    #[test]
    fn header_lookup_is_whitespace_and_case_tolerant() {
        let config = ParserConfig::default();
        assert_eq!(config.canonical_for("Property ID"), Some(ENTITY_ID));
        assert_eq!(config.canonical_for("  property id "), Some(ENTITY_ID));
        assert_eq!(config.canonical_for("Sections"), None);
    }

    #[test]
    fn yaml_profile_overrides_defaults_field_by_field() {
        let config: ParserConfig = serde_yaml::from_str(
            "delimiter: semicolon\ncolumns:\n  Erf: entity_id\n  State: status\n",
        )
        .expect("yaml");
        assert_eq!(config.delimiter, Delimiter::Semicolon);
        assert_eq!(config.canonical_for("Erf"), Some(ENTITY_ID));
        assert!(config.identifier_patterns.contains_key(POLE_NUMBER));
    }
}
