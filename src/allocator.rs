// 🔢 Surrogate Key Allocator
//
// Issues record ids that are positive, strictly increasing and never reused.
// The SQLite sequence commits every value as soon as it is issued, so a change
// set that later fails to apply leaves a gap instead of handing the same id out
// twice.

use crate::error::PersistenceError;
use crate::model::RecordId;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

/// Name of the sequence shared by every dataset in a history table
pub const HISTORY_SEQUENCE: &str = "history_rows";

pub trait KeyAllocator {
    fn next(&mut self) -> Result<RecordId, PersistenceError>;
}

// ============================================================================
// SQLITE SEQUENCE
// ============================================================================

/// Durable sequence stored in `key_sequences`.
///
/// Must not be used while a transaction is open on the same connection,
/// otherwise issued values would roll back with it.
pub struct SqliteSequence<'c> {
    conn: &'c Connection,
    name: String,
}

impl<'c> SqliteSequence<'c> {
    /// Open (creating if needed) a named sequence.
    ///
    /// The sequence is fast-forwarded past every record id already stored, so a
    /// table restored without its sequence row still never sees a reused id.
    pub fn open(conn: &'c Connection, name: &str) -> Result<Self, PersistenceError> {
        conn.execute(
            "INSERT INTO key_sequences (name, last_value) VALUES (?1, 0)
             ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        conn.execute(
            "UPDATE key_sequences
             SET last_value = MAX(last_value, (SELECT COALESCE(MAX(record_id), 0) FROM history_rows))
             WHERE name = ?1",
            params![name],
        )?;

        Ok(SqliteSequence {
            conn,
            name: name.to_string(),
        })
    }

    /// Highest id issued or stored so far, read without touching the sequence.
    pub fn peek(conn: &Connection, name: &str) -> Result<i64, PersistenceError> {
        let value = conn.query_row(
            "SELECT MAX(
                COALESCE((SELECT last_value FROM key_sequences WHERE name = ?1), 0),
                COALESCE((SELECT MAX(record_id) FROM history_rows), 0)
             )",
            params![name],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// Last value issued (0 if none)
    pub fn last_value(&self) -> Result<i64, PersistenceError> {
        let value = self.conn.query_row(
            "SELECT last_value FROM key_sequences WHERE name = ?1",
            params![self.name],
            |row| row.get(0),
        )?;
        Ok(value)
    }
}

impl KeyAllocator for SqliteSequence<'_> {
    fn next(&mut self) -> Result<RecordId, PersistenceError> {
        let issued: Option<i64> = self
            .conn
            .query_row(
                "UPDATE key_sequences
                 SET last_value = last_value + 1
                 WHERE name = ?1 AND last_value < ?2
                 RETURNING last_value",
                params![self.name, i64::MAX],
                |row| row.get(0),
            )
            .optional()?;

        match issued {
            Some(value) => {
                debug!(sequence = %self.name, record_id = value, "issued record id");
                Ok(RecordId(value))
            }
            None => Err(PersistenceError::AllocatorExhausted {
                name: self.name.clone(),
            }),
        }
    }
}

// ============================================================================
// IN-MEMORY SEQUENCE
// ============================================================================

/// Sequence that lives only as long as the process; for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySequence {
    last: i64,
}

impl MemorySequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after an existing maximum id
    pub fn starting_after(last: i64) -> Self {
        MemorySequence { last: last.max(0) }
    }

    pub fn last_value(&self) -> i64 {
        self.last
    }
}

impl KeyAllocator for MemorySequence {
    fn next(&mut self) -> Result<RecordId, PersistenceError> {
        match self.last.checked_add(1) {
            Some(next) => {
                self.last = next;
                Ok(RecordId(next))
            }
            None => Err(PersistenceError::AllocatorExhausted {
                name: "memory".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_sqlite_sequence_is_strictly_increasing() {
        let conn = conn();
        let mut seq = SqliteSequence::open(&conn, HISTORY_SEQUENCE).unwrap();

        let ids: Vec<i64> = (0..5).map(|_| seq.next().unwrap().get()).collect();

        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(seq.last_value().unwrap(), 5);
    }

    #[test]
    fn test_sqlite_sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");

        {
            let conn = Connection::open(&path).unwrap();
            setup_database(&conn).unwrap();
            let mut seq = SqliteSequence::open(&conn, HISTORY_SEQUENCE).unwrap();
            seq.next().unwrap();
            seq.next().unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        setup_database(&conn).unwrap();
        let mut seq = SqliteSequence::open(&conn, HISTORY_SEQUENCE).unwrap();

        assert_eq!(seq.next().unwrap(), RecordId(3));
    }

    #[test]
    fn test_sqlite_sequence_not_rolled_back_with_caller_failure() {
        let mut conn = conn();
        {
            let mut seq = SqliteSequence::open(&conn, HISTORY_SEQUENCE).unwrap();
            assert_eq!(seq.next().unwrap(), RecordId(1));
        }

        // The write that used id 1 never commits
        let tx = conn.transaction().unwrap();
        tx.execute(
            "INSERT INTO history_rows
                (record_id, dataset, business_key, attributes, source_label, is_current, begin_date, end_date)
             VALUES (1, 'daily', '2024-01-01', '{}', 'seed', 1, '2024-01-02', NULL)",
            [],
        )
        .unwrap();
        drop(tx);

        let mut seq = SqliteSequence::open(&conn, HISTORY_SEQUENCE).unwrap();
        assert_eq!(seq.next().unwrap(), RecordId(2));
    }

    #[test]
    fn test_sqlite_sequence_skips_past_existing_rows() {
        let conn = conn();
        conn.execute(
            "INSERT INTO history_rows
                (record_id, dataset, business_key, attributes, source_label, is_current, begin_date, end_date)
             VALUES (41, 'daily', '2024-01-01', '{}', 'seed', 1, '2024-01-02', NULL)",
            [],
        )
        .unwrap();

        let mut seq = SqliteSequence::open(&conn, HISTORY_SEQUENCE).unwrap();

        assert_eq!(seq.next().unwrap(), RecordId(42));
    }

    #[test]
    fn test_peek_reads_without_writing() {
        let conn = conn();

        assert_eq!(SqliteSequence::peek(&conn, HISTORY_SEQUENCE).unwrap(), 0);
        let sequences: i64 = conn
            .query_row("SELECT COUNT(*) FROM key_sequences", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sequences, 0);

        {
            let mut seq = SqliteSequence::open(&conn, HISTORY_SEQUENCE).unwrap();
            seq.next().unwrap();
            seq.next().unwrap();
        }
        assert_eq!(SqliteSequence::peek(&conn, HISTORY_SEQUENCE).unwrap(), 2);
    }

    #[test]
    fn test_sqlite_sequence_exhaustion() {
        let conn = conn();
        let mut seq = SqliteSequence::open(&conn, HISTORY_SEQUENCE).unwrap();
        conn.execute(
            "UPDATE key_sequences SET last_value = ?1 WHERE name = ?2",
            params![i64::MAX, HISTORY_SEQUENCE],
        )
        .unwrap();

        let err = seq.next().unwrap_err();
        assert!(matches!(err, PersistenceError::AllocatorExhausted { .. }));
    }

    #[test]
    fn test_memory_sequence() {
        let mut seq = MemorySequence::starting_after(10);

        assert_eq!(seq.next().unwrap(), RecordId(11));
        assert_eq!(seq.next().unwrap(), RecordId(12));
        assert_eq!(seq.last_value(), 12);

        let mut full = MemorySequence::starting_after(i64::MAX);
        assert!(full.next().is_err());
    }
}
