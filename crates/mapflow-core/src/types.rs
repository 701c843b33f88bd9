use std::fmt;
use std::path::PathBuf;

use blake3::Hasher;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use mapflow_parser::{PointLabel as Label, RowIssue, SourceFormat};

/// Inclusive start, exclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Stable point identity derived from rounded coordinates and an id namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PointId(String);

impl PointId {
    const HEX_LEN: usize = 20;

    /// Coordinates are scaled by `10^precision` and rounded to integers before
    /// hashing, so `-0.0` and `0.0` (and values within the rounding tolerance)
    /// collapse to one id.
    pub fn derive(latitude: f64, longitude: f64, namespace: &str, precision: u32) -> Self {
        let scale = 10f64.powi(precision as i32);
        let lat = (latitude * scale).round() as i64;
        let lon = (longitude * scale).round() as i64;

        let mut hasher = Hasher::new();
        hasher.update(format!("{lat}:{lon}:{precision}:{namespace}").as_bytes());
        let hex = hasher.finalize().to_hex();
        Self(hex[..Self::HEX_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledPoint {
    pub id: PointId,
    pub latitude: f64,
    pub longitude: f64,
    pub observation_date: NaiveDate,
    pub label: Label,
    pub source_dataset: String,
    /// Row within the source, kept for diagnostics.
    pub row: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub name: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    Source {
        path: PathBuf,
        format: SourceFormat,
        reader: String,
        content_hash: String,
        /// Digest of the reading configuration the points were derived with.
        config_hash: String,
        ingested_at: DateTime<Utc>,
    },
    Consolidated {
        inputs: Vec<SnapshotRef>,
        consolidated_at: DateTime<Utc>,
    },
}

/// Immutable snapshot of one registered source (or of a consolidation).
/// Re-ingesting a source builds a new snapshot instead of mutating this one.
#[derive(Debug, Clone)]
pub struct LabeledDataset {
    name: String,
    points: Vec<LabeledPoint>,
    provenance: Provenance,
    row_issues: Vec<RowIssue>,
    snapshot_hash: String,
}

impl LabeledDataset {
    pub fn new(
        name: impl Into<String>,
        points: Vec<LabeledPoint>,
        provenance: Provenance,
        row_issues: Vec<RowIssue>,
    ) -> Self {
        let name = name.into();
        let snapshot_hash = snapshot_hash(&name, &points);
        Self {
            name,
            points,
            provenance,
            row_issues,
            snapshot_hash,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[LabeledPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn row_issues(&self) -> &[RowIssue] {
        &self.row_issues
    }

    pub fn snapshot_hash(&self) -> &str {
        &self.snapshot_hash
    }

    pub fn snapshot_ref(&self) -> SnapshotRef {
        SnapshotRef {
            name: self.name.clone(),
            hash: self.snapshot_hash.clone(),
        }
    }
}

/// Digest over the canonical point content. Ingestion time and source path
/// are deliberately excluded so re-ingesting identical content is a no-op.
fn snapshot_hash(name: &str, points: &[LabeledPoint]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    for point in points {
        let line = format!(
            "{}\t{:.7}\t{:.7}\t{}\t{}\n",
            point.id, point.latitude, point.longitude, point.observation_date, point.label
        );
        hasher.update(line.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

pub(crate) fn content_hash(contents: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(contents);
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_pins_rounding_tolerance() {
        let a = PointId::derive(10.0, 20.0, "", 4);
        let b = PointId::derive(10.0, 20.0001, "", 4);
        assert_ne!(a, b);

        let a = PointId::derive(10.0, 20.0, "", 3);
        let b = PointId::derive(10.0, 20.0001, "", 3);
        assert_eq!(a, b);

        assert_eq!(
            PointId::derive(-0.0, 0.0, "", 4),
            PointId::derive(0.0, -0.00001, "", 4)
        );
        assert_ne!(
            PointId::derive(10.0, 20.0, "east", 4),
            PointId::derive(10.0, 20.0, "west", 4)
        );
    }

    #[test]
    fn date_range_is_half_open() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 1, 11).unwrap(),
        );
        assert_eq!(range.num_days(), 10);
        assert!(range.contains(range.start));
        assert!(!range.contains(range.end));
    }
}
