// 🏗️ Raw Input - loosely-typed rows handed over by the upstream parser
//
// Spreadsheet and HTML parsing happen upstream. What reaches us is a table of
// cells that may already carry a type (spreadsheet numbers, dates) or may be
// plain text (CSV exports, scraped tables).

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

// ============================================================================
// RAW CELLS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawField {
    Empty,
    Text(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
}

impl RawField {
    /// Text cells are taken as-is; blank text is treated as an empty cell
    pub fn text(value: &str) -> Self {
        if value.trim().is_empty() {
            RawField::Empty
        } else {
            RawField::Text(value.to_string())
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RawField::Empty)
    }

    /// Cell rendered for error messages
    pub fn display(&self) -> String {
        match self {
            RawField::Empty => String::new(),
            RawField::Text(v) => v.clone(),
            RawField::Integer(v) => v.to_string(),
            RawField::Float(v) => v.to_string(),
            RawField::Date(v) => v.to_string(),
        }
    }
}

// ============================================================================
// RAW ROW
// ============================================================================

/// One row of upstream output, keyed by raw column name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRow {
    /// 1-based position in the upstream table (header excluded)
    pub line: usize,
    pub fields: HashMap<String, RawField>,
    /// File the row was read from, when it came from one
    #[serde(default)]
    pub artifact: Option<String>,
}

impl RawRow {
    pub fn new(line: usize) -> Self {
        RawRow {
            line,
            fields: HashMap::new(),
            artifact: None,
        }
    }

    /// Builder: record the file this row came from
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    /// Builder: add one cell
    pub fn with(mut self, column: impl Into<String>, value: RawField) -> Self {
        self.fields.insert(column.into(), value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&RawField> {
        self.fields.get(column)
    }
}

// ============================================================================
// CSV EXPORTS
// ============================================================================

/// Read a CSV export of the upstream table. Every cell arrives as text.
///
/// Rows are tagged with the file name, which `SourceLabelPolicy::Artifact`
/// uses as their source label.
pub fn read_csv(path: &Path) -> Result<Vec<RawRow>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open raw input {}", path.display()))?;
    let mut rows = read_csv_from(file)
        .with_context(|| format!("Failed to read raw input {}", path.display()))?;

    if let Some(name) = path.file_name() {
        let artifact = name.to_string_lossy().into_owned();
        for row in &mut rows {
            row.artifact = Some(artifact.clone());
        }
    }
    Ok(rows)
}

pub fn read_csv_from<R: Read>(reader: R) -> Result<Vec<RawRow>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (index, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read CSV row {}", index + 1))?;

        // Short rows leave trailing columns missing, which the normalizer reports
        let mut row = RawRow::new(index + 1);
        for (header, value) in headers.iter().zip(record.iter()) {
            row.fields.insert(header.clone(), RawField::text(value));
        }
        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_csv_keeps_text_cells() {
        let data = "Date,Migrants arrived,Notes\n2024-01-01,10,\n2024-01-02,\"1,204\",Weather\n";

        let rows = read_csv_from(data.as_bytes()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].line, 1);
        assert_eq!(rows[0].get("Date"), Some(&RawField::Text("2024-01-01".to_string())));
        assert_eq!(rows[0].get("Notes"), Some(&RawField::Empty));
        assert_eq!(rows[1].get("Migrants arrived"), Some(&RawField::Text("1,204".to_string())));
    }

    #[test]
    fn test_short_row_omits_missing_columns() {
        let data = "Date,Migrants arrived,Notes\n2024-01-01,10\n";

        let rows = read_csv_from(data.as_bytes()).unwrap();

        assert!(rows[0].get("Migrants arrived").is_some());
        assert!(rows[0].get("Notes").is_none());
    }

    #[test]
    fn test_header_whitespace_trimmed() {
        let data = " Date , Boats arrived\n2024-01-01,2\n";

        let rows = read_csv_from(data.as_bytes()).unwrap();

        assert!(rows[0].get("Boats arrived").is_some());
    }

    #[test]
    fn test_read_csv_tags_rows_with_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeseries-2024-01.csv");
        std::fs::write(&path, "Date,Boats arrived\n2024-01-01,2\n2024-01-02,0\n").unwrap();

        let rows = read_csv(&path).unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .all(|r| r.artifact.as_deref() == Some("timeseries-2024-01.csv")));
        assert_eq!(read_csv_from("Date\n2024-01-01\n".as_bytes()).unwrap()[0].artifact, None);
    }
}
