// 🚨 Error kinds for a historization run
//
// Every kind is fatal for the dataset being processed. Errors propagate to the
// orchestrator, which logs them and decides whether to rerun.

use chrono::NaiveDate;
use thiserror::Error;

use crate::model::RecordId;

// ============================================================================
// SCHEMA ERRORS (normalizer)
// ============================================================================

/// Raw input could not be turned into typed records.
///
/// `line` is the 1-based row number of the raw input (header excluded).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("row {line}: missing field `{field}`")]
    MissingField { line: usize, field: String },

    #[error("row {line}: field `{field}` is empty but required")]
    MissingValue { line: usize, field: String },

    #[error("row {line}: field `{field}` value {value:?} is not a valid {expected}")]
    InvalidValue {
        line: usize,
        field: String,
        value: String,
        expected: &'static str,
    },

    #[error("dataset `{dataset}` labels records by artifact name but no artifact was given")]
    MissingSourceLabel { dataset: String },
}

// ============================================================================
// MERGE ERRORS (reconciliation)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("business key {business_key} appears {count} times in the incoming snapshot")]
    DuplicateBusinessKey { business_key: NaiveDate, count: usize },

    #[error("business key {business_key} has more than one current row ({first} and {second})")]
    DuplicateCurrentRow {
        business_key: NaiveDate,
        first: RecordId,
        second: RecordId,
    },

    #[error("row {record_id} was passed as current but is closed")]
    NotCurrent { record_id: RecordId },

    #[error("row {record_id} belongs to dataset `{found}`, expected `{expected}`")]
    DatasetMismatch {
        record_id: RecordId,
        expected: String,
        found: String,
    },

    #[error(
        "business key {business_key}: attribute `{attribute}` changed type from {current} to {incoming}"
    )]
    TypeMismatch {
        business_key: NaiveDate,
        attribute: String,
        current: &'static str,
        incoming: &'static str,
    },

    #[error(
        "closing row {record_id} as of {as_of} would end it on {end_date}, before it began on {begin_date}"
    )]
    ClosesBeforeBegin {
        record_id: RecordId,
        as_of: NaiveDate,
        begin_date: NaiveDate,
        end_date: NaiveDate,
    },

    #[error("as-of date {as_of} has no previous day")]
    DateOutOfRange { as_of: NaiveDate },
}

// ============================================================================
// PERSISTENCE ERRORS (store + allocator)
// ============================================================================

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("could not encode attributes: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("row {record_id} is no longer current, refusing to close it")]
    StaleClosure { record_id: RecordId },

    #[error("key sequence `{name}` is exhausted")]
    AllocatorExhausted { name: String },
}

// ============================================================================
// CONFIG ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown dataset `{0}`")]
    UnknownDataset(String),

    #[error("dataset `{dataset}` maps `{name}` more than once")]
    DuplicateColumn { dataset: String, name: String },
}

// ============================================================================
// RUN ERROR
// ============================================================================

/// Any failure of a pipeline run, tagged by the stage that produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_names_row_and_field() {
        let err = SchemaError::InvalidValue {
            line: 4,
            field: "Migrants arrived".to_string(),
            value: "ten".to_string(),
            expected: "integer",
        };

        let msg = err.to_string();
        assert!(msg.contains("row 4"));
        assert!(msg.contains("Migrants arrived"));
        assert!(msg.contains("ten"));
    }

    #[test]
    fn test_run_error_keeps_stage() {
        let err: Error = MergeError::DateOutOfRange {
            as_of: NaiveDate::MIN,
        }
        .into();

        assert!(matches!(err, Error::Merge(_)));
        assert!(err.to_string().starts_with("merge error"));
    }
}
