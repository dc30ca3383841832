use std::path::PathBuf;

use onemap_snapshot::{
    extract_snapshot_date, ParserConfig, RowRejection, SnapshotParser, ADDRESS, AGENT, LATITUDE,
};

fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/onemap")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

#[test]
fn short_row_in_a_ten_column_export_is_skipped() {
    let parser = SnapshotParser::new(ParserConfig::default()).expect("parser");
    let snapshot = parser.parse(&fixture("Lawley_02072025.csv")).expect("parse");

    let malformed: Vec<_> = snapshot.malformed().collect();
    assert_eq!(malformed.len(), 1);
    assert_eq!(malformed[0].line_number(), 4);
    assert!(snapshot.records.iter().all(|r| r.entity_id != "249113"));
}

#[test]
fn text_in_latitude_excludes_the_row_and_lowers_the_rate() {
    let parser = SnapshotParser::new(ParserConfig::default()).expect("parser");
    let snapshot = parser.parse(&fixture("Lawley_02072025.csv")).expect("parse");

    let shifts: Vec<_> = snapshot.field_shifts().collect();
    assert_eq!(shifts.len(), 1);
    assert_eq!(shifts[0].entity_id, "249115");
    assert_eq!(shifts[0].field, LATITUDE);
    assert!(snapshot.records.iter().all(|r| r.entity_id != "249115"));

    assert_eq!(snapshot.report.total_rows, 5);
    assert_eq!(snapshot.report.valid_rows, 3);
    assert!((snapshot.report.validation_rate() - 0.75).abs() < 1e-9);
    assert!(snapshot.report.is_degraded());
    assert!(snapshot
        .rejections
        .iter()
        .any(|r| matches!(r, RowRejection::FieldShift(_))));
}

#[test]
fn semicolon_export_is_sniffed() {
    let parser = SnapshotParser::new(ParserConfig::default()).expect("parser");
    let snapshot = parser.parse(&fixture("Lawley_03072025.csv")).expect("parse");
    assert_eq!(snapshot.records.len(), 3);
    assert!(snapshot.rejections.is_empty());
    let record = snapshot
        .records
        .iter()
        .find(|r| r.entity_id == "249114")
        .expect("249114");
    assert_eq!(
        record.attributes.get(ADDRESS).map(String::as_str),
        Some("3, Limpopo Crescent Lawley")
    );
    assert_eq!(record.agent.as_deref(), Some("Lerato Dube"));
    assert!(!record.attributes.contains_key(AGENT));
}

#[test]
fn fixture_names_carry_their_snapshot_dates() {
    for (name, expected) in [
        ("Lawley_01072025.csv", "2025-07-01"),
        ("Lawley_02072025.csv", "2025-07-02"),
        ("Lawley_03072025.csv", "2025-07-03"),
    ] {
        assert_eq!(
            extract_snapshot_date(name, 2025).map(|d| d.to_string()),
            Some(expected.to_string())
        );
    }
}
