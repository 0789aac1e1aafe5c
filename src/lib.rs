// Crossing History - Core Library
// SCD2 historization of small-boat crossing counts, shared by the CLI and API server

pub mod allocator;
pub mod config;
pub mod data_quality;
pub mod db;
pub mod error;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod parser;
pub mod pipeline;

// Re-export commonly used types
pub use allocator::{KeyAllocator, MemorySequence, SqliteSequence, HISTORY_SEQUENCE};
pub use config::{ColumnSpec, Config, DatasetConfig, FieldType, SourceLabelPolicy};
pub use data_quality::{check_history, IntegrityIssue, IntegrityReport, Severity};
pub use db::{setup_database, DatasetStat, HistoryStore, MergeRun};
pub use error::{ConfigError, Error, MergeError, PersistenceError, Result, SchemaError};
pub use merge::{ChangeSet, Closure, MergeCounts, MergeEngine, Reconciliation};
pub use model::{AttributeValue, Attributes, HistoryRow, Record, RecordId};
pub use normalize::{IngestContext, Normalizer};
pub use parser::{read_csv, read_csv_from, RawField, RawRow};
pub use pipeline::{ingest, plan, RunOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
