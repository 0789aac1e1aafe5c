// 📐 Snapshot Normalizer - raw rows → typed records
//
// Validates that every configured column is present and coercible, and tags
// each record with the source label of the artifact it came from. The first bad
// cell aborts the batch.
// Duplicate business keys are passed through untouched.

use crate::config::{ColumnSpec, DatasetConfig, FieldType, SourceLabelPolicy};
use crate::error::SchemaError;
use crate::model::{AttributeValue, Attributes, Record};
use crate::parser::{RawField, RawRow};
use chrono::NaiveDate;
use tracing::debug;

/// What the orchestrator knows about the batch being ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestContext {
    pub run_date: NaiveDate,
    /// File name of the fetched artifact, when there is one
    pub artifact: Option<String>,
}

impl IngestContext {
    pub fn new(run_date: NaiveDate) -> Self {
        IngestContext {
            run_date,
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }
}

pub struct Normalizer<'a> {
    dataset: &'a DatasetConfig,
}

impl<'a> Normalizer<'a> {
    pub fn new(dataset: &'a DatasetConfig) -> Self {
        Normalizer { dataset }
    }

    /// Normalize a batch, preserving input order.
    ///
    /// A batch may concatenate rows from several artifacts; each record is
    /// labelled from the row it came from.
    pub fn normalize(&self, rows: &[RawRow], ctx: &IngestContext) -> Result<Vec<Record>, SchemaError> {
        let records = rows
            .iter()
            .map(|row| {
                let source_label = self.source_label(row, ctx)?;
                self.normalize_row(row, source_label)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            dataset = %self.dataset.name,
            rows = records.len(),
            "normalized snapshot"
        );
        Ok(records)
    }

    /// Provenance tag of one row. Under the artifact policy the row's own file
    /// wins over the batch-wide artifact of `ctx`.
    pub fn source_label(&self, row: &RawRow, ctx: &IngestContext) -> Result<String, SchemaError> {
        match &self.dataset.source_label {
            SourceLabelPolicy::Artifact => row
                .artifact
                .as_ref()
                .or(ctx.artifact.as_ref())
                .cloned()
                .ok_or_else(|| SchemaError::MissingSourceLabel {
                    dataset: self.dataset.name.clone(),
                }),
            SourceLabelPolicy::RunDate { suffix } => Ok(format!("{}{}", ctx.run_date, suffix)),
        }
    }

    fn normalize_row(&self, row: &RawRow, source_label: String) -> Result<Record, SchemaError> {
        let key_spec = &self.dataset.business_key;
        let business_key = match coerce(row, key_spec, false)? {
            AttributeValue::Date(day) => day,
            other => {
                return Err(SchemaError::InvalidValue {
                    line: row.line,
                    field: key_spec.source.clone(),
                    value: other.to_string(),
                    expected: "date",
                })
            }
        };

        let mut attributes = Attributes::new();
        for spec in &self.dataset.attributes {
            let value = coerce(row, spec, spec.nullable)?;
            attributes.insert(spec.name.clone(), value);
        }

        Ok(Record {
            business_key,
            attributes,
            source_label,
        })
    }
}

// ============================================================================
// COERCION
// ============================================================================

fn coerce(row: &RawRow, spec: &ColumnSpec, nullable: bool) -> Result<AttributeValue, SchemaError> {
    let field = row.get(&spec.source).ok_or_else(|| SchemaError::MissingField {
        line: row.line,
        field: spec.source.clone(),
    })?;

    if field.is_empty() {
        return if nullable {
            Ok(AttributeValue::Null)
        } else {
            Err(SchemaError::MissingValue {
                line: row.line,
                field: spec.source.clone(),
            })
        };
    }

    let coerced = match &spec.field_type {
        FieldType::Integer => coerce_integer(field).map(AttributeValue::Integer),
        FieldType::Text => Some(AttributeValue::Text(field.display().trim().to_string())),
        FieldType::Date { formats } => coerce_date(field, formats).map(AttributeValue::Date),
    };

    coerced.ok_or_else(|| SchemaError::InvalidValue {
        line: row.line,
        field: spec.source.clone(),
        value: field.display(),
        expected: spec.field_type.name(),
    })
}

fn coerce_integer(field: &RawField) -> Option<i64> {
    match field {
        RawField::Integer(v) => Some(*v),
        RawField::Float(v) => integral(*v),
        RawField::Text(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            cleaned
                .parse::<i64>()
                .ok()
                .or_else(|| cleaned.parse::<f64>().ok().and_then(integral))
        }
        RawField::Empty | RawField::Date(_) => None,
    }
}

/// Spreadsheet exports sometimes carry counts as `12.0`
fn integral(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn coerce_date(field: &RawField, formats: &[String]) -> Option<NaiveDate> {
    match field {
        RawField::Date(day) => Some(*day),
        RawField::Text(s) => {
            let s = s.trim();
            formats
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
        }
        _ => None,
    }
}
