use std::path::Path;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("valid regex"));
static COMPACT_DMY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\D)(\d{2})(\d{2})(\d{4})(?:\D|$)").expect("valid regex"));
static MONTH_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*[\s_-]*(\d{1,2})(?:\D|$)",
    )
    .expect("valid regex")
});

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Snapshot date encoded in an export's file name.
///
/// Understands `2025-07-01`, `Lawley_01072025` (day, month, year) and
/// `June 22` style names; the last form takes `fallback_year`. Returns `None`
/// when nothing in the name is a valid calendar date.
pub fn extract_snapshot_date(file_name: &str, fallback_year: i32) -> Option<NaiveDate> {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());

    if let Some(caps) = ISO_DATE.captures(&stem) {
        if let Some(date) = ymd(&caps[1], &caps[2], &caps[3]) {
            return Some(date);
        }
    }
    if let Some(caps) = COMPACT_DMY.captures(&stem) {
        if let Some(date) = ymd(&caps[3], &caps[2], &caps[1]) {
            return Some(date);
        }
    }
    let caps = MONTH_DAY.captures(&stem)?;
    let prefix = caps[1].to_ascii_lowercase();
    let month = MONTHS.iter().position(|m| *m == prefix)? as u32 + 1;
    let day = caps[2].parse().ok()?;
    NaiveDate::from_ymd_opt(fallback_year, month, day)
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    #[test]
    fn understands_the_export_naming_styles() {
        assert_eq!(extract_snapshot_date("onemap-2025-07-01.csv", 2025), date(2025, 7, 1));
        assert_eq!(
            extract_snapshot_date("Lawley_01082025.csv", 2024),
            date(2025, 8, 1)
        );
        assert_eq!(
            extract_snapshot_date("Lawley May Week 3 22052025.csv", 2024),
            date(2025, 5, 22)
        );
        assert_eq!(extract_snapshot_date("June 22.csv", 2025), date(2025, 6, 22));
        assert_eq!(extract_snapshot_date("june_3 export.csv", 2025), date(2025, 6, 3));
    }

    #[test]
    fn impossible_dates_fall_through() {
        assert_eq!(extract_snapshot_date("Lawley_45132025.csv", 2025), None);
        assert_eq!(extract_snapshot_date("export.csv", 2025), None);
        assert_eq!(extract_snapshot_date("Feb 30.csv", 2025), None);
    }
}
