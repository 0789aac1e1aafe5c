// ⚖️ Merge Engine - SCD2 reconciliation of a snapshot against current history
//
// Keyed by business key, three-way:
//   - in both, same attributes      → nothing
//   - in both, attributes differ    → close current row, insert new version
//   - only in current history       → close current row
//   - only in the incoming snapshot → insert new version
//
// Reconciliation is pure and computed in memory; record ids are attached
// afterwards so the plan can be checked before any key is spent.

use crate::allocator::KeyAllocator;
use crate::error::{MergeError, PersistenceError, Result};
use crate::model::{attribute, Attributes, HistoryRow, Record, RecordId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// ============================================================================
// CHANGE SET
// ============================================================================

/// Closing of one current row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub record_id: RecordId,
    pub business_key: NaiveDate,
    pub begin_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// How each business key was resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    pub unchanged: usize,
    pub changed: usize,
    pub added: usize,
    pub removed: usize,
}

/// Everything one run writes, applied as a single transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub dataset: String,
    pub as_of: NaiveDate,
    pub closures: Vec<Closure>,
    pub inserts: Vec<HistoryRow>,
    pub counts: MergeCounts,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.closures.is_empty() && self.inserts.is_empty()
    }

    /// SHA-256 of the change set's JSON encoding, recorded in the run log
    pub fn digest(&self) -> std::result::Result<String, serde_json::Error> {
        let encoded = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn summary(&self) -> String {
        format!(
            "{} as of {}: {} added, {} changed, {} removed, {} unchanged",
            self.dataset,
            self.as_of,
            self.counts.added,
            self.counts.changed,
            self.counts.removed,
            self.counts.unchanged
        )
    }
}

// ============================================================================
// RECONCILIATION (before key allocation)
// ============================================================================

/// Reconciled plan whose new versions have no record id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub dataset: String,
    pub as_of: NaiveDate,
    pub closures: Vec<Closure>,
    /// New versions in business key order
    pub pending: Vec<Record>,
    pub counts: MergeCounts,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.closures.is_empty() && self.pending.is_empty()
    }

    /// Assign record ids in business key order.
    pub fn allocate(
        self,
        allocator: &mut dyn KeyAllocator,
    ) -> std::result::Result<ChangeSet, PersistenceError> {
        let mut inserts = Vec::with_capacity(self.pending.len());
        for record in &self.pending {
            let record_id = allocator.next()?;
            inserts.push(HistoryRow::open(record_id, &self.dataset, record, self.as_of));
        }

        Ok(ChangeSet {
            dataset: self.dataset,
            as_of: self.as_of,
            closures: self.closures,
            inserts,
            counts: self.counts,
        })
    }
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

pub struct MergeEngine {
    dataset: String,
}

impl MergeEngine {
    pub fn new(dataset: impl Into<String>) -> Self {
        MergeEngine {
            dataset: dataset.into(),
        }
    }

    /// Reconcile and allocate ids in one step.
    pub fn merge(
        &self,
        current: &[HistoryRow],
        incoming: &[Record],
        as_of: NaiveDate,
        allocator: &mut dyn KeyAllocator,
    ) -> Result<ChangeSet> {
        let plan = self.reconcile(current, incoming, as_of)?;
        Ok(plan.allocate(allocator)?)
    }

    /// Three-way reconciliation of `incoming` against the `current` rows.
    ///
    /// Input order does not matter; output is sorted by business key.
    pub fn reconcile(
        &self,
        current: &[HistoryRow],
        incoming: &[Record],
        as_of: NaiveDate,
    ) -> std::result::Result<Reconciliation, MergeError> {
        let current_by_key = self.index_current(current)?;
        let incoming_by_key = index_incoming(incoming)?;

        let keys: BTreeSet<NaiveDate> = current_by_key
            .keys()
            .chain(incoming_by_key.keys())
            .copied()
            .collect();

        let mut closures = Vec::new();
        let mut pending = Vec::new();
        let mut counts = MergeCounts::default();

        for key in keys {
            match (current_by_key.get(&key), incoming_by_key.get(&key)) {
                (Some(row), Some(record)) => {
                    if attributes_differ(key, &row.attributes, &record.attributes)? {
                        debug!(dataset = %self.dataset, business_key = %key, record_id = row.record_id.get(), "attributes changed");
                        closures.push(close(row, as_of)?);
                        pending.push((*record).clone());
                        counts.changed += 1;
                    } else {
                        counts.unchanged += 1;
                    }
                }
                (Some(row), None) => {
                    debug!(dataset = %self.dataset, business_key = %key, record_id = row.record_id.get(), "missing from snapshot");
                    closures.push(close(row, as_of)?);
                    counts.removed += 1;
                }
                (None, Some(record)) => {
                    pending.push((*record).clone());
                    counts.added += 1;
                }
                (None, None) => unreachable!("key comes from one of the two maps"),
            }
        }

        Ok(Reconciliation {
            dataset: self.dataset.clone(),
            as_of,
            closures,
            pending,
            counts,
        })
    }

    fn index_current<'r>(
        &self,
        current: &'r [HistoryRow],
    ) -> std::result::Result<BTreeMap<NaiveDate, &'r HistoryRow>, MergeError> {
        let mut by_key: BTreeMap<NaiveDate, &HistoryRow> = BTreeMap::new();

        for row in current {
            if row.dataset != self.dataset {
                return Err(MergeError::DatasetMismatch {
                    record_id: row.record_id,
                    expected: self.dataset.clone(),
                    found: row.dataset.clone(),
                });
            }
            if !row.is_current || row.end_date.is_some() {
                return Err(MergeError::NotCurrent {
                    record_id: row.record_id,
                });
            }
            if let Some(existing) = by_key.insert(row.business_key, row) {
                return Err(MergeError::DuplicateCurrentRow {
                    business_key: row.business_key,
                    first: existing.record_id.min(row.record_id),
                    second: existing.record_id.max(row.record_id),
                });
            }
        }

        Ok(by_key)
    }
}

fn index_incoming(incoming: &[Record]) -> std::result::Result<BTreeMap<NaiveDate, &Record>, MergeError> {
    let mut by_key: BTreeMap<NaiveDate, &Record> = BTreeMap::new();
    let mut occurrences: BTreeMap<NaiveDate, usize> = BTreeMap::new();

    for record in incoming {
        *occurrences.entry(record.business_key).or_default() += 1;
        by_key.insert(record.business_key, record);
    }

    // Report the earliest duplicated key so the error is deterministic
    if let Some((&business_key, &count)) = occurrences.iter().find(|(_, &count)| count > 1) {
        return Err(MergeError::DuplicateBusinessKey { business_key, count });
    }

    Ok(by_key)
}

/// Compare attribute maps over the union of their names.
///
/// Absent and `Null` are the same thing. Two non-null values of different
/// types cannot be compared and fail the whole run.
fn attributes_differ(
    business_key: NaiveDate,
    current: &Attributes,
    incoming: &Attributes,
) -> std::result::Result<bool, MergeError> {
    let names: BTreeSet<&String> = current.keys().chain(incoming.keys()).collect();
    let mut differ = false;

    for name in names {
        let old = attribute(current, name);
        let new = attribute(incoming, name);

        if !old.is_null() && !new.is_null() && old.type_name() != new.type_name() {
            return Err(MergeError::TypeMismatch {
                business_key,
                attribute: name.clone(),
                current: old.type_name(),
                incoming: new.type_name(),
            });
        }
        differ |= old != new;
    }

    Ok(differ)
}

/// Close a current row the day before `as_of`.
fn close(row: &HistoryRow, as_of: NaiveDate) -> std::result::Result<Closure, MergeError> {
    let end_date = as_of
        .pred_opt()
        .ok_or(MergeError::DateOutOfRange { as_of })?;

    if end_date < row.begin_date {
        return Err(MergeError::ClosesBeforeBegin {
            record_id: row.record_id,
            as_of,
            begin_date: row.begin_date,
            end_date,
        });
    }

    Ok(Closure {
        record_id: row.record_id,
        business_key: row.business_key,
        begin_date: row.begin_date,
        end_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MemorySequence;
    use crate::model::AttributeValue;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(key: NaiveDate, migrants: i64, boats: i64) -> Record {
        Record::new(key, "test.ods")
            .with("migrants_arrived", migrants)
            .with("boats_arrived", boats)
    }

    fn current_row(id: i64, record: &Record, begin: NaiveDate) -> HistoryRow {
        HistoryRow::open(RecordId(id), "daily", record, begin)
    }

    fn engine() -> MergeEngine {
        MergeEngine::new("daily")
    }

    #[test]
    fn test_new_key_is_inserted() {
        let incoming = vec![record(day(2024, 1, 1), 10, 2)];
        let mut seq = MemorySequence::new();

        let changes = engine()
            .merge(&[], &incoming, day(2024, 1, 2), &mut seq)
            .unwrap();

        assert!(changes.closures.is_empty());
        assert_eq!(changes.inserts.len(), 1);
        let row = &changes.inserts[0];
        assert_eq!(row.record_id, RecordId(1));
        assert_eq!(row.business_key, day(2024, 1, 1));
        assert_eq!(row.attributes["migrants_arrived"], AttributeValue::Integer(10));
        assert_eq!(row.attributes["boats_arrived"], AttributeValue::Integer(2));
        assert_eq!(row.begin_date, day(2024, 1, 2));
        assert_eq!(row.end_date, None);
        assert!(row.is_current);
        assert_eq!(changes.counts.added, 1);
    }

    #[test]
    fn test_changed_value_closes_and_replaces() {
        let old = record(day(2024, 1, 1), 10, 2);
        let current = vec![current_row(1, &old, day(2024, 1, 2))];
        let incoming = vec![record(day(2024, 1, 1), 12, 2)];
        let mut seq = MemorySequence::starting_after(1);

        let changes = engine()
            .merge(&current, &incoming, day(2024, 1, 3), &mut seq)
            .unwrap();

        assert_eq!(
            changes.closures,
            vec![Closure {
                record_id: RecordId(1),
                business_key: day(2024, 1, 1),
                begin_date: day(2024, 1, 2),
                end_date: day(2024, 1, 2),
            }]
        );
        assert_eq!(changes.inserts.len(), 1);
        let row = &changes.inserts[0];
        assert_eq!(row.record_id, RecordId(2));
        assert_eq!(row.attributes["migrants_arrived"], AttributeValue::Integer(12));
        assert_eq!(row.begin_date, day(2024, 1, 3));
        assert!(row.is_current);
        assert_eq!(changes.counts.changed, 1);
    }

    #[test]
    fn test_missing_key_is_closed_without_replacement() {
        let old = record(day(2024, 1, 1), 10, 2);
        let current = vec![current_row(1, &old, day(2024, 1, 2))];
        let mut seq = MemorySequence::new();

        let changes = engine()
            .merge(&current, &[], day(2024, 1, 5), &mut seq)
            .unwrap();

        assert_eq!(changes.closures.len(), 1);
        assert_eq!(changes.closures[0].end_date, day(2024, 1, 4));
        assert!(changes.inserts.is_empty());
        assert_eq!(changes.counts.removed, 1);
        assert_eq!(seq.last_value(), 0);
    }

    #[test]
    fn test_unchanged_snapshot_is_empty() {
        let snapshot = record(day(2024, 1, 1), 10, 2);
        let current = vec![current_row(1, &snapshot, day(2024, 1, 2))];
        let mut seq = MemorySequence::new();

        let changes = engine()
            .merge(&current, &[snapshot], day(2024, 1, 2), &mut seq)
            .unwrap();

        assert!(changes.is_empty());
        assert_eq!(changes.counts.unchanged, 1);
    }

    #[test]
    fn test_source_label_alone_is_not_a_change() {
        let snapshot = record(day(2024, 1, 1), 10, 2);
        let current = vec![current_row(1, &snapshot, day(2024, 1, 2))];
        let mut relabelled = snapshot.clone();
        relabelled.source_label = "newer-file.ods".to_string();

        let plan = engine()
            .reconcile(&current, &[relabelled], day(2024, 1, 9))
            .unwrap();

        assert!(plan.is_empty());
    }

    #[test]
    fn test_null_equals_null() {
        let with_null = record(day(2024, 1, 1), 10, 2).with("notes", None::<&str>);
        let without = record(day(2024, 1, 1), 10, 2);
        let current = vec![current_row(1, &with_null, day(2024, 1, 2))];

        let plan = engine()
            .reconcile(&current, &[without], day(2024, 1, 3))
            .unwrap();

        assert!(plan.is_empty());
    }

    #[test]
    fn test_null_to_value_is_a_change() {
        let with_null = record(day(2024, 1, 1), 10, 2).with("notes", None::<&str>);
        let with_note = record(day(2024, 1, 1), 10, 2).with("notes", "Revised");
        let current = vec![current_row(1, &with_null, day(2024, 1, 2))];

        let plan = engine()
            .reconcile(&current, &[with_note], day(2024, 1, 3))
            .unwrap();

        assert_eq!(plan.counts.changed, 1);
        assert_eq!(plan.closures.len(), 1);
        assert_eq!(plan.pending.len(), 1);
    }

    #[test]
    fn test_order_does_not_matter() {
        let a = record(day(2024, 1, 1), 10, 2);
        let b = record(day(2024, 1, 2), 20, 3);
        let c = record(day(2024, 1, 3), 30, 4);
        let current = vec![
            current_row(1, &record(day(2024, 1, 1), 9, 2), day(2024, 1, 2)),
            current_row(2, &record(day(2023, 12, 31), 5, 1), day(2024, 1, 2)),
        ];

        let forward = engine()
            .reconcile(&current, &[a.clone(), b.clone(), c.clone()], day(2024, 1, 4))
            .unwrap();
        let mut reversed_current = current.clone();
        reversed_current.reverse();
        let backward = engine()
            .reconcile(&reversed_current, &[c, b, a], day(2024, 1, 4))
            .unwrap();

        assert_eq!(forward, backward);
        let keys: Vec<NaiveDate> = forward.pending.iter().map(|r| r.business_key).collect();
        assert_eq!(keys, vec![day(2024, 1, 1), day(2024, 1, 2), day(2024, 1, 3)]);
        assert_eq!(forward.closures.len(), 2);
    }

    #[test]
    fn test_ids_follow_business_key_order() {
        let incoming = vec![
            record(day(2024, 1, 3), 1, 1),
            record(day(2024, 1, 1), 1, 1),
            record(day(2024, 1, 2), 1, 1),
        ];
        let mut seq = MemorySequence::starting_after(100);

        let changes = engine()
            .merge(&[], &incoming, day(2024, 1, 4), &mut seq)
            .unwrap();

        let ids: Vec<(NaiveDate, i64)> = changes
            .inserts
            .iter()
            .map(|r| (r.business_key, r.record_id.get()))
            .collect();
        assert_eq!(
            ids,
            vec![
                (day(2024, 1, 1), 101),
                (day(2024, 1, 2), 102),
                (day(2024, 1, 3), 103)
            ]
        );
    }

    #[test]
    fn test_duplicate_incoming_key_is_rejected() {
        let incoming = vec![
            record(day(2024, 1, 2), 1, 1),
            record(day(2024, 1, 1), 10, 2),
            record(day(2024, 1, 1), 11, 2),
        ];

        let err = engine().reconcile(&[], &incoming, day(2024, 1, 3)).unwrap_err();

        assert_eq!(
            err,
            MergeError::DuplicateBusinessKey {
                business_key: day(2024, 1, 1),
                count: 2
            }
        );
    }

    #[test]
    fn test_duplicate_current_rows_are_rejected() {
        let r = record(day(2024, 1, 1), 10, 2);
        let current = vec![current_row(7, &r, day(2024, 1, 2)), current_row(3, &r, day(2024, 1, 2))];

        let err = engine().reconcile(&current, &[], day(2024, 1, 3)).unwrap_err();

        assert_eq!(
            err,
            MergeError::DuplicateCurrentRow {
                business_key: day(2024, 1, 1),
                first: RecordId(3),
                second: RecordId(7)
            }
        );
    }

    #[test]
    fn test_closed_row_passed_as_current_is_rejected() {
        let r = record(day(2024, 1, 1), 10, 2);
        let mut row = current_row(1, &r, day(2024, 1, 2));
        row.is_current = false;
        row.end_date = Some(day(2024, 1, 4));

        let err = engine().reconcile(&[row], &[r], day(2024, 1, 6)).unwrap_err();

        assert_eq!(err, MergeError::NotCurrent { record_id: RecordId(1) });
    }

    #[test]
    fn test_row_from_other_dataset_is_rejected() {
        let r = record(day(2024, 1, 1), 10, 2);
        let row = HistoryRow::open(RecordId(1), "weekly", &r, day(2024, 1, 2));

        let err = engine().reconcile(&[row], &[], day(2024, 1, 6)).unwrap_err();

        assert!(matches!(err, MergeError::DatasetMismatch { .. }));
    }

    #[test]
    fn test_type_change_fails_comparison() {
        let old = record(day(2024, 1, 1), 10, 2);
        let current = vec![current_row(1, &old, day(2024, 1, 2))];
        let incoming = vec![Record::new(day(2024, 1, 1), "test.ods")
            .with("migrants_arrived", "10")
            .with("boats_arrived", 2i64)];

        let err = engine()
            .reconcile(&current, &incoming, day(2024, 1, 3))
            .unwrap_err();

        assert_eq!(
            err,
            MergeError::TypeMismatch {
                business_key: day(2024, 1, 1),
                attribute: "migrants_arrived".to_string(),
                current: "integer",
                incoming: "text",
            }
        );
    }

    #[test]
    fn test_same_day_change_would_close_before_begin() {
        let old = record(day(2024, 1, 1), 10, 2);
        let current = vec![current_row(1, &old, day(2024, 1, 3))];
        let incoming = vec![record(day(2024, 1, 1), 12, 2)];

        let err = engine()
            .reconcile(&current, &incoming, day(2024, 1, 3))
            .unwrap_err();

        assert!(matches!(
            err,
            MergeError::ClosesBeforeBegin { record_id: RecordId(1), .. }
        ));
    }

    #[test]
    fn test_as_of_without_previous_day() {
        let old = record(day(2024, 1, 1), 10, 2);
        let row = current_row(1, &old, NaiveDate::MIN);

        let err = engine().reconcile(&[row], &[], NaiveDate::MIN).unwrap_err();

        assert_eq!(err, MergeError::DateOutOfRange { as_of: NaiveDate::MIN });
    }

    #[test]
    fn test_failed_reconcile_spends_no_ids() {
        let incoming = vec![record(day(2024, 1, 1), 1, 1), record(day(2024, 1, 1), 2, 1)];
        let mut seq = MemorySequence::new();

        let result = engine().merge(&[], &incoming, day(2024, 1, 2), &mut seq);

        assert!(result.is_err());
        assert_eq!(seq.last_value(), 0);
    }

    #[test]
    fn test_digest_is_stable() {
        let incoming = vec![record(day(2024, 1, 1), 10, 2)];
        let a = engine()
            .merge(&[], &incoming, day(2024, 1, 2), &mut MemorySequence::new())
            .unwrap();
        let b = engine()
            .merge(&[], &incoming, day(2024, 1, 2), &mut MemorySequence::new())
            .unwrap();

        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap().len(), 64);
    }
}
