// ✅ History Integrity - re-checks stored versions against the SCD2 invariants
//
// Critical issues mean the table can no longer be trusted for point-in-time
// queries. Warnings describe legal but notable shapes (a key that vanished and
// later came back has a gap in its timeline).

use crate::model::{HistoryRow, RecordId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub severity: Severity,
    pub business_key: NaiveDate,
    pub record_id: RecordId,
    pub issue: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub dataset: String,
    pub business_keys: usize,
    pub versions: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} keys, {} versions, {} issues ({} critical)",
            self.dataset,
            self.business_keys,
            self.versions,
            self.issues.len(),
            self.issues
                .iter()
                .filter(|i| i.severity == Severity::Critical)
                .count()
        )
    }
}

/// Check all versions of a dataset.
///
/// `rows` must be ordered by business key, then begin date, then record id
/// (the order `HistoryStore::all_rows` returns).
pub fn check_history(dataset: &str, rows: &[HistoryRow]) -> IntegrityReport {
    let mut issues = Vec::new();
    let mut business_keys = 0;

    for versions in rows.chunk_by(|a, b| a.business_key == b.business_key) {
        business_keys += 1;
        check_key(versions, &mut issues);
    }

    IntegrityReport {
        dataset: dataset.to_string(),
        business_keys,
        versions: rows.len(),
        issues,
    }
}

fn check_key(versions: &[HistoryRow], issues: &mut Vec<IntegrityIssue>) {
    let mut push = |severity, row: &HistoryRow, issue: String| {
        issues.push(IntegrityIssue {
            severity,
            business_key: row.business_key,
            record_id: row.record_id,
            issue,
        })
    };

    for row in versions {
        if !row.is_well_formed() {
            push(
                Severity::Critical,
                row,
                format!(
                    "is_current={} with end_date={:?} (begins {})",
                    row.is_current, row.end_date, row.begin_date
                ),
            );
        }
    }

    let current = versions.iter().filter(|r| r.is_current).count();
    if current > 1 {
        push(
            Severity::Critical,
            &versions[0],
            format!("{} current versions", current),
        );
    }

    for pair in versions.windows(2) {
        let (older, newer) = (&pair[0], &pair[1]);

        if newer.record_id <= older.record_id {
            push(
                Severity::Critical,
                newer,
                format!("record id not greater than previous version {}", older.record_id),
            );
        }

        match older.end_date {
            None => push(
                Severity::Critical,
                older,
                format!("still open while a later version begins {}", newer.begin_date),
            ),
            Some(end) if end >= newer.begin_date => push(
                Severity::Critical,
                newer,
                format!("overlaps previous version ending {}", end),
            ),
            Some(end) if end.succ_opt() != Some(newer.begin_date) => push(
                Severity::Warning,
                newer,
                format!("gap after previous version ending {} (key reappeared)", end),
            ),
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Attributes;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn version(id: i64, key: NaiveDate, begin: NaiveDate, end: Option<NaiveDate>) -> HistoryRow {
        HistoryRow {
            record_id: RecordId(id),
            dataset: "daily".to_string(),
            business_key: key,
            attributes: Attributes::new(),
            source_label: "test".to_string(),
            is_current: end.is_none(),
            begin_date: begin,
            end_date: end,
        }
    }

    #[test]
    fn test_contiguous_history_is_clean() {
        let key = day(2024, 1, 1);
        let rows = vec![
            version(1, key, day(2024, 1, 2), Some(day(2024, 1, 2))),
            version(4, key, day(2024, 1, 3), Some(day(2024, 1, 9))),
            version(9, key, day(2024, 1, 10), None),
            version(2, day(2024, 1, 2), day(2024, 1, 3), None),
        ];

        let report = check_history("daily", &rows);

        assert!(report.is_clean(), "{:?}", report.issues);
        assert_eq!(report.business_keys, 2);
        assert_eq!(report.versions, 4);
    }

    #[test]
    fn test_two_current_versions() {
        let key = day(2024, 1, 1);
        let rows = vec![
            version(1, key, day(2024, 1, 2), None),
            version(2, key, day(2024, 1, 3), None),
        ];

        let report = check_history("daily", &rows);

        assert!(report.has_critical_issues());
        assert!(report.issues.iter().any(|i| i.issue.contains("2 current versions")));
    }

    #[test]
    fn test_overlap_is_critical() {
        let key = day(2024, 1, 1);
        let rows = vec![
            version(1, key, day(2024, 1, 2), Some(day(2024, 1, 5))),
            version(2, key, day(2024, 1, 4), None),
        ];

        let report = check_history("daily", &rows);

        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].severity, Severity::Critical);
        assert_eq!(report.issues[0].record_id, RecordId(2));
    }

    #[test]
    fn test_reappearance_is_a_warning() {
        let key = day(2024, 1, 1);
        let rows = vec![
            version(1, key, day(2024, 1, 2), Some(day(2024, 1, 3))),
            version(7, key, day(2024, 2, 1), None),
        ];

        let report = check_history("daily", &rows);

        assert!(!report.is_clean());
        assert!(!report.has_critical_issues());
        assert_eq!(report.issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_malformed_row() {
        let mut row = version(1, day(2024, 1, 1), day(2024, 1, 2), None);
        row.is_current = false;

        let report = check_history("daily", &[row]);

        assert!(report.has_critical_issues());
        assert!(report.summary().contains("1 critical"));
    }
}
