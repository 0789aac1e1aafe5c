// 🏛️ Dataset Configuration - column mappings and run settings
//
// Each dataset says which raw column holds the business key, which raw columns
// become which canonical attributes (and with what type), and how records
// are labelled with their provenance.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

// ============================================================================
// FIELD TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Calendar date; strings are tried against each chrono format in order
    Date {
        #[serde(default = "default_date_formats")]
        formats: Vec<String>,
    },
    Integer,
    Text,
}

fn default_date_formats() -> Vec<String> {
    vec!["%Y-%m-%d".to_string()]
}

fn default_true() -> bool {
    true
}

impl FieldType {
    pub fn iso_date() -> Self {
        FieldType::Date {
            formats: default_date_formats(),
        }
    }

    pub fn date_with_formats(formats: &[&str]) -> Self {
        FieldType::Date {
            formats: formats.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Date { .. } => "date",
            FieldType::Integer => "integer",
            FieldType::Text => "text",
        }
    }
}

// ============================================================================
// COLUMN SPEC
// ============================================================================

/// Maps one raw column onto a canonical attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name as produced by the upstream parser
    pub source: String,

    /// Canonical attribute name stored in history
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Whether an empty cell is accepted (stored as null)
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn new(source: impl Into<String>, name: impl Into<String>, field_type: FieldType) -> Self {
        ColumnSpec {
            source: source.into(),
            name: name.into(),
            field_type,
            nullable: true,
        }
    }

    /// Builder: reject empty cells
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

// ============================================================================
// SOURCE LABEL POLICY
// ============================================================================

/// How the provenance tag of a batch is derived from the ingestion context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLabelPolicy {
    /// Name of the fetched artifact (e.g. the downloaded spreadsheet)
    Artifact,

    /// Run date followed by a fixed suffix, e.g. `2024-01-02-update`
    RunDate {
        #[serde(default)]
        suffix: String,
    },
}

// ============================================================================
// DATASET CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub business_key: ColumnSpec,
    pub attributes: Vec<ColumnSpec>,
    pub source_label: SourceLabelPolicy,
}

impl DatasetConfig {
    /// Every column the normalizer expects, business key first
    pub fn columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        std::iter::once(&self.business_key).chain(self.attributes.iter())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for column in self.columns() {
            if !seen.insert(column.name.as_str()) {
                return Err(ConfigError::DuplicateColumn {
                    dataset: self.name.clone(),
                    name: column.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Daily counts from the time-series spreadsheet (sheet SB_01)
    pub fn daily() -> Self {
        DatasetConfig {
            name: "daily".to_string(),
            business_key: ColumnSpec::new("Date", "date_ending", FieldType::iso_date()).required(),
            attributes: crossing_counts("Boats arrived - involved in uncontrolled landings"),
            source_label: SourceLabelPolicy::Artifact,
        }
    }

    /// Rolling last-7-days table from the publication page
    pub fn seven_day() -> Self {
        DatasetConfig {
            name: "seven_day".to_string(),
            business_key: ColumnSpec::new(
                "Date",
                "date_ending",
                FieldType::date_with_formats(&["%d %B %Y", "%Y-%m-%d"]),
            )
            .required(),
            attributes: crossing_counts("Boats involved in uncontrolled landings"),
            source_label: SourceLabelPolicy::RunDate {
                suffix: "-update".to_string(),
            },
        }
    }

    /// Weekly totals from the time-series spreadsheet
    pub fn weekly() -> Self {
        DatasetConfig {
            name: "weekly".to_string(),
            business_key: ColumnSpec::new("Week ending", "date_ending", FieldType::iso_date())
                .required(),
            attributes: crossing_counts("Boats arrived - involved in uncontrolled landings"),
            source_label: SourceLabelPolicy::Artifact,
        }
    }
}

fn crossing_counts(uncontrolled_column: &str) -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("Migrants arrived", "migrants_arrived", FieldType::Integer),
        ColumnSpec::new("Boats arrived", "boats_arrived", FieldType::Integer),
        ColumnSpec::new(
            uncontrolled_column,
            "boats_arrived_involved_in_uncontrolled_landings",
            FieldType::Integer,
        ),
        ColumnSpec::new("Notes", "notes", FieldType::Text),
    ]
}

// ============================================================================
// CONFIG
// ============================================================================

fn default_database() -> PathBuf {
    PathBuf::from("crossing_history.db")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database")]
    pub database: PathBuf,

    pub datasets: Vec<DatasetConfig>,
}

impl Config {
    /// Built-in presets for the small-boat crossing feeds
    pub fn builtin() -> Self {
        Config {
            database: default_database(),
            datasets: vec![
                DatasetConfig::daily(),
                DatasetConfig::seven_day(),
                DatasetConfig::weekly(),
            ],
        }
    }

    /// Load a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_json(&text).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: display,
                source,
            },
            other => other,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        for dataset in &config.datasets {
            dataset.validate()?;
        }
        Ok(config)
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig, ConfigError> {
        self.datasets
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ConfigError::UnknownDataset(name.to_string()))
    }

    pub fn dataset_names(&self) -> Vec<&str> {
        self.datasets.iter().map(|d| d.name.as_str()).collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::builtin()
    }
}
