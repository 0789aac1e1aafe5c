// 🗄️ History Store - SQLite-backed SCD2 table
//
// One append-mostly table of versions keyed by record_id. Rows are never
// deleted: a version is closed by setting end_date and clearing is_current.
// All writes of a run go through `apply`, inside a single transaction.

use crate::allocator::{SqliteSequence, HISTORY_SEQUENCE};
use crate::data_quality::{check_history, IntegrityReport};
use crate::error::PersistenceError;
use crate::merge::ChangeSet;
use crate::model::{Attributes, HistoryRow, RecordId};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

type StoreResult<T> = Result<T, PersistenceError>;

const ROW_COLUMNS: &str =
    "record_id, dataset, business_key, attributes, source_label, is_current, begin_date, end_date";

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> StoreResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // History table: one row per version
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS history_rows (
            record_id INTEGER PRIMARY KEY CHECK (record_id > 0),
            dataset TEXT NOT NULL,
            business_key TEXT NOT NULL,
            attributes TEXT NOT NULL,
            source_label TEXT NOT NULL,
            is_current INTEGER NOT NULL CHECK (is_current IN (0, 1)),
            begin_date TEXT NOT NULL,
            end_date TEXT,
            CHECK (
                (is_current = 1 AND end_date IS NULL)
                OR (is_current = 0 AND end_date IS NOT NULL AND begin_date <= end_date)
            )
        )",
        [],
    )?;

    // At most one current version per business key
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_history_one_current
         ON history_rows(dataset, business_key) WHERE is_current = 1",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_history_key
         ON history_rows(dataset, business_key, begin_date)",
        [],
    )?;

    // ==========================================================================
    // Surrogate key sequences
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS key_sequences (
            name TEXT PRIMARY KEY,
            last_value INTEGER NOT NULL CHECK (last_value >= 0)
        )",
        [],
    )?;

    // ==========================================================================
    // Run log (one row per applied change set)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS merge_runs (
            run_id TEXT PRIMARY KEY,
            dataset TEXT NOT NULL,
            as_of TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            inserted INTEGER NOT NULL,
            closed INTEGER NOT NULL,
            unchanged INTEGER NOT NULL,
            digest TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_merge_runs_dataset ON merge_runs(dataset, applied_at)",
        [],
    )?;

    // Latest view for dashboards
    conn.execute(
        "CREATE VIEW IF NOT EXISTS latest_rows AS
         SELECT record_id, dataset, business_key, attributes, source_label, begin_date
         FROM history_rows
         WHERE is_current = 1",
        [],
    )?;

    Ok(())
}

// ============================================================================
// RUN LOG / STATS
// ============================================================================

/// Audit entry for one applied change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRun {
    pub run_id: String,
    pub dataset: String,
    pub as_of: NaiveDate,
    pub applied_at: DateTime<Utc>,
    pub inserted: usize,
    pub closed: usize,
    pub unchanged: usize,
    pub digest: String,
}

/// Per-dataset row counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStat {
    pub dataset: String,
    pub current_rows: i64,
    pub total_versions: i64,
    pub last_change: Option<NaiveDate>,
}

// ============================================================================
// HISTORY STORE
// ============================================================================

/// Explicit handle on the history database. Dropping it closes the connection.
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened history database");
        Self::from_connection(conn)
    }

    /// Open an existing database for queries only.
    ///
    /// Skips schema setup; every write through this handle fails.
    pub fn open_read_only(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        debug!(path = %path.display(), "opened history database read-only");
        Ok(HistoryStore { conn })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> StoreResult<Self> {
        setup_database(&conn)?;
        Ok(HistoryStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Durable allocator for new record ids.
    ///
    /// Borrow it for the merge only; `apply` needs the store exclusively.
    pub fn sequence(&self) -> StoreResult<SqliteSequence<'_>> {
        SqliteSequence::open(&self.conn, HISTORY_SEQUENCE)
    }

    /// Highest record id issued so far, without opening the sequence
    pub fn last_record_id(&self) -> StoreResult<i64> {
        SqliteSequence::peek(&self.conn, HISTORY_SEQUENCE)
    }

    /// All current rows of a dataset, ordered by business key
    pub fn current_rows(&self, dataset: &str) -> StoreResult<Vec<HistoryRow>> {
        self.query_rows(
            &format!(
                "SELECT {ROW_COLUMNS} FROM history_rows
                 WHERE dataset = ?1 AND is_current = 1
                 ORDER BY business_key"
            ),
            params![dataset],
        )
    }

    /// Apply a change set atomically.
    ///
    /// Closures are applied first and each must hit exactly one current row.
    /// Any failure drops the transaction, rolling back every write of the run.
    /// An empty change set writes nothing and returns `None`.
    pub fn apply(&mut self, changes: &ChangeSet) -> StoreResult<Option<MergeRun>> {
        if changes.is_empty() {
            info!(dataset = %changes.dataset, as_of = %changes.as_of, "nothing to apply");
            return Ok(None);
        }

        let run = MergeRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            dataset: changes.dataset.clone(),
            as_of: changes.as_of,
            applied_at: Utc::now(),
            inserted: changes.inserts.len(),
            closed: changes.closures.len(),
            unchanged: changes.counts.unchanged,
            digest: changes.digest()?,
        };

        let tx = self.conn.transaction()?;

        for closure in &changes.closures {
            let updated = tx.execute(
                "UPDATE history_rows
                 SET is_current = 0, end_date = ?1
                 WHERE record_id = ?2 AND dataset = ?3 AND is_current = 1",
                params![
                    closure.end_date.to_string(),
                    closure.record_id.get(),
                    changes.dataset
                ],
            )?;
            if updated != 1 {
                return Err(PersistenceError::StaleClosure {
                    record_id: closure.record_id,
                });
            }
        }

        for row in &changes.inserts {
            let attributes_json = serde_json::to_string(&row.attributes)?;
            tx.execute(
                &format!(
                    "INSERT INTO history_rows ({ROW_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    row.record_id.get(),
                    row.dataset,
                    row.business_key.to_string(),
                    attributes_json,
                    row.source_label,
                    row.is_current,
                    row.begin_date.to_string(),
                    row.end_date.map(|d| d.to_string()),
                ],
            )?;
        }

        tx.execute(
            "INSERT INTO merge_runs (
                run_id, dataset, as_of, applied_at, inserted, closed, unchanged, digest
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.run_id,
                run.dataset,
                run.as_of.to_string(),
                run.applied_at.to_rfc3339(),
                run.inserted as i64,
                run.closed as i64,
                run.unchanged as i64,
                run.digest,
            ],
        )?;

        tx.commit()?;

        info!(
            dataset = %run.dataset,
            as_of = %run.as_of,
            run_id = %run.run_id,
            inserted = run.inserted,
            closed = run.closed,
            "applied change set"
        );
        Ok(Some(run))
    }

    /// The version of a business key valid on `date`, if any
    pub fn as_of(
        &self,
        dataset: &str,
        business_key: NaiveDate,
        date: NaiveDate,
    ) -> StoreResult<Option<HistoryRow>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ROW_COLUMNS} FROM history_rows
                     WHERE dataset = ?1 AND business_key = ?2
                       AND begin_date <= ?3
                       AND (end_date IS NULL OR end_date >= ?3)
                     ORDER BY begin_date DESC
                     LIMIT 1"
                ),
                params![dataset, business_key.to_string(), date.to_string()],
                history_row_from_sql,
            )
            .optional()?;
        Ok(row)
    }

    /// Every business key's version valid on `date`
    pub fn snapshot_as_of(&self, dataset: &str, date: NaiveDate) -> StoreResult<Vec<HistoryRow>> {
        self.query_rows(
            &format!(
                "SELECT {ROW_COLUMNS} FROM history_rows
                 WHERE dataset = ?1
                   AND begin_date <= ?2
                   AND (end_date IS NULL OR end_date >= ?2)
                 ORDER BY business_key"
            ),
            params![dataset, date.to_string()],
        )
    }

    /// All versions of one business key, oldest first
    pub fn history(&self, dataset: &str, business_key: NaiveDate) -> StoreResult<Vec<HistoryRow>> {
        self.query_rows(
            &format!(
                "SELECT {ROW_COLUMNS} FROM history_rows
                 WHERE dataset = ?1 AND business_key = ?2
                 ORDER BY begin_date, record_id"
            ),
            params![dataset, business_key.to_string()],
        )
    }

    /// Every stored version of a dataset, by business key then age
    pub fn all_rows(&self, dataset: &str) -> StoreResult<Vec<HistoryRow>> {
        self.query_rows(
            &format!(
                "SELECT {ROW_COLUMNS} FROM history_rows
                 WHERE dataset = ?1
                 ORDER BY business_key, begin_date, record_id"
            ),
            params![dataset],
        )
    }

    pub fn datasets(&self) -> StoreResult<Vec<DatasetStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT dataset, SUM(is_current), COUNT(*), MAX(begin_date)
             FROM history_rows
             GROUP BY dataset
             ORDER BY dataset",
        )?;

        let stats = stmt
            .query_map([], |row| {
                let last_change: Option<String> = row.get(3)?;
                Ok(DatasetStat {
                    dataset: row.get(0)?,
                    current_rows: row.get(1)?,
                    total_versions: row.get(2)?,
                    last_change: last_change.map(|s| parse_date(3, &s)).transpose()?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(stats)
    }

    /// Run log of a dataset, newest first
    pub fn runs(&self, dataset: &str) -> StoreResult<Vec<MergeRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, dataset, as_of, applied_at, inserted, closed, unchanged, digest
             FROM merge_runs
             WHERE dataset = ?1
             ORDER BY applied_at DESC",
        )?;

        let runs = stmt
            .query_map(params![dataset], |row| {
                let as_of: String = row.get(2)?;
                let applied_at: String = row.get(3)?;
                let inserted: i64 = row.get(4)?;
                let closed: i64 = row.get(5)?;
                let unchanged: i64 = row.get(6)?;

                Ok(MergeRun {
                    run_id: row.get(0)?,
                    dataset: row.get(1)?,
                    as_of: parse_date(2, &as_of)?,
                    applied_at: DateTime::parse_from_rfc3339(&applied_at)
                        .map_err(|e| conversion_error(3, e))?
                        .with_timezone(&Utc),
                    inserted: inserted as usize,
                    closed: closed as usize,
                    unchanged: unchanged as usize,
                    digest: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    /// Re-check the history invariants on stored rows
    pub fn verify(&self, dataset: &str) -> StoreResult<IntegrityReport> {
        let rows = self.all_rows(dataset)?;
        Ok(check_history(dataset, &rows))
    }

    fn query_rows<P: rusqlite::Params>(&self, sql: &str, params: P) -> StoreResult<Vec<HistoryRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, history_row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ============================================================================
// ROW DECODING
// ============================================================================

fn history_row_from_sql(row: &Row<'_>) -> rusqlite::Result<HistoryRow> {
    let business_key: String = row.get(2)?;
    let attributes_json: String = row.get(3)?;
    let begin_date: String = row.get(6)?;
    let end_date: Option<String> = row.get(7)?;

    let attributes: Attributes =
        serde_json::from_str(&attributes_json).map_err(|e| conversion_error(3, e))?;

    Ok(HistoryRow {
        record_id: RecordId(row.get(0)?),
        dataset: row.get(1)?,
        business_key: parse_date(2, &business_key)?,
        attributes,
        source_label: row.get(4)?,
        is_current: row.get(5)?,
        begin_date: parse_date(6, &begin_date)?,
        end_date: end_date.map(|s| parse_date(7, &s)).transpose()?,
    })
}

fn parse_date(idx: usize, value: &str) -> rusqlite::Result<NaiveDate> {
    value
        .parse::<NaiveDate>()
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}
