use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Csv,
    Tsv,
    GeoJson,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "csv",
            SourceFormat::Tsv => "tsv",
            SourceFormat::GeoJson => "geo_json",
        }
    }

    /// Maps a file extension (without the dot) to a format.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(SourceFormat::Csv),
            "tsv" | "tab" => Some(SourceFormat::Tsv),
            "geojson" | "json" => Some(SourceFormat::GeoJson),
            _ => None,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for SourceFormat {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(SourceFormat::Csv),
            "tsv" => Ok(SourceFormat::Tsv),
            "geojson" | "geo_json" => Ok(SourceFormat::GeoJson),
            other => Err(format!("unknown source format '{other}'")),
        }
    }
}

/// Class label of a point. `Unlabeled` marks inference points.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointLabel {
    Class(String),
    Unlabeled,
}

impl PointLabel {
    pub const UNLABELED_MARKER: &'static str = "unlabeled";

    pub fn class_name(&self) -> Option<&str> {
        match self {
            PointLabel::Class(name) => Some(name.as_str()),
            PointLabel::Unlabeled => None,
        }
    }

    pub fn is_unlabeled(&self) -> bool {
        matches!(self, PointLabel::Unlabeled)
    }
}

impl fmt::Display for PointLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointLabel::Class(name) => f.write_str(name),
            PointLabel::Unlabeled => f.write_str(Self::UNLABELED_MARKER),
        }
    }
}

/// Explicit column names that take precedence over alias matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnOverrides {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub date: Option<String>,
    pub label: Option<String>,
    pub geometry: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub columns: ColumnOverrides,
    /// Every point in the source is an inference point; no label column is required.
    pub unlabeled: bool,
    /// Observation date used when the source carries no date column.
    pub default_date: Option<NaiveDate>,
    /// chrono format string tried before the built-in date formats.
    pub date_format: Option<String>,
    /// Source label encoding to canonical label.
    pub label_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// 1-based position of the row among the source's data rows (or features).
    pub row: usize,
    pub latitude: f64,
    pub longitude: f64,
    pub observation_date: NaiveDate,
    pub label: PointLabel,
}

/// A row that could not be mapped to a point. Not fatal for the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowIssue {
    pub row: usize,
    pub message: String,
}

impl RowIssue {
    pub fn new(row: usize, message: impl Into<String>) -> Self {
        Self {
            row,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub reader: &'static str,
    pub format: SourceFormat,
    pub rows: Vec<SourceRow>,
    pub issues: Vec<RowIssue>,
}
