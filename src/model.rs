// ⏰ Data Model - Records and their versioned history
//
// A Record is one observation for a business key (a reporting date).
// A HistoryRow is one persisted version of it:
//   - record_id: surrogate identity, never reused or changed
//   - begin_date / end_date: the days this version was valid (end inclusive)
//   - is_current: the version dashboards treat as latest

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// SURROGATE KEY
// ============================================================================

/// Surrogate key of a stored version. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl RecordId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// ATTRIBUTE VALUES
// ============================================================================

/// Typed value of one named attribute.
///
/// `Null` compares equal to `Null`, so blank cells that stay blank never
/// produce a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Null,
    Integer(i64),
    Text(String),
    Date(NaiveDate),
}

impl AttributeValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Null => "null",
            AttributeValue::Integer(_) => "integer",
            AttributeValue::Text(_) => "text",
            AttributeValue::Date(_) => "date",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => write!(f, "null"),
            AttributeValue::Integer(v) => write!(f, "{}", v),
            AttributeValue::Text(v) => write!(f, "{:?}", v),
            AttributeValue::Date(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Integer(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<Option<&str>> for AttributeValue {
    fn from(v: Option<&str>) -> Self {
        v.map_or(AttributeValue::Null, AttributeValue::from)
    }
}

/// Named attributes of a record, ordered by name for stable encoding.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Look up an attribute, treating a missing name as `Null`.
pub fn attribute<'a>(attributes: &'a Attributes, name: &str) -> &'a AttributeValue {
    static NULL: AttributeValue = AttributeValue::Null;
    attributes.get(name).unwrap_or(&NULL)
}

// ============================================================================
// RECORD
// ============================================================================

/// One normalized observation, produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub business_key: NaiveDate,
    pub attributes: Attributes,
    pub source_label: String,
}

impl Record {
    pub fn new(business_key: NaiveDate, source_label: impl Into<String>) -> Self {
        Record {
            business_key,
            attributes: Attributes::new(),
            source_label: source_label.into(),
        }
    }

    /// Builder: set one attribute
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

// ============================================================================
// HISTORY ROW
// ============================================================================

/// One persisted version of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub record_id: RecordId,
    pub dataset: String,
    pub business_key: NaiveDate,
    pub attributes: Attributes,
    pub source_label: String,
    pub is_current: bool,
    pub begin_date: NaiveDate,
    /// Last day this version was valid. `None` while current.
    pub end_date: Option<NaiveDate>,
}

impl HistoryRow {
    /// Build the current version for an incoming record.
    pub fn open(record_id: RecordId, dataset: &str, record: &Record, begin_date: NaiveDate) -> Self {
        HistoryRow {
            record_id,
            dataset: dataset.to_string(),
            business_key: record.business_key,
            attributes: record.attributes.clone(),
            source_label: record.source_label.clone(),
            is_current: true,
            begin_date,
            end_date: None,
        }
    }

    /// Check if this version was valid on a given day
    pub fn was_valid_on(&self, day: NaiveDate) -> bool {
        self.begin_date <= day && self.end_date.map_or(true, |end| day <= end)
    }

    /// `end_date` is present exactly when the row is closed, and never precedes `begin_date`.
    pub fn is_well_formed(&self) -> bool {
        match (self.is_current, self.end_date) {
            (true, None) => true,
            (false, Some(end)) => self.begin_date <= end,
            _ => false,
        }
    }
}
