use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::settings::Settings;
use crate::types::{Label, LabeledDataset, LabeledPoint, PointId, Provenance};

pub const CONSOLIDATED_NAME: &str = "consolidated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// The reader could not map the row (bad coordinate, date or label cell).
    UnreadableRow,
    NonFiniteCoordinate,
    LatitudeOutOfRange,
    LongitudeOutOfRange,
    UnknownLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub dataset: String,
    pub row: usize,
    pub point_id: Option<PointId>,
    pub kind: ViolationKind,
    pub message: String,
}

/// Every row-level violation of a consolidation, in dataset then row order.
#[derive(Debug, Clone, Error)]
#[error("{} row-level violation(s) across the input datasets", .violations.len())]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone)]
pub struct Consolidation {
    pub dataset: LabeledDataset,
    pub violations: Vec<Violation>,
    pub input_points: usize,
    pub duplicates_collapsed: usize,
}

impl Consolidation {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Fails when any row was rejected.
    pub fn into_strict(self) -> Result<LabeledDataset, ValidationError> {
        if self.violations.is_empty() {
            Ok(self.dataset)
        } else {
            Err(ValidationError {
                violations: self.violations,
            })
        }
    }
}

fn check_point(point: &LabeledPoint, known: &HashSet<&str>) -> Option<(ViolationKind, String)> {
    if !point.latitude.is_finite() || !point.longitude.is_finite() {
        return Some((
            ViolationKind::NonFiniteCoordinate,
            format!("coordinate ({}, {}) is not finite", point.latitude, point.longitude),
        ));
    }
    if !(-90.0..=90.0).contains(&point.latitude) {
        return Some((
            ViolationKind::LatitudeOutOfRange,
            format!("latitude {} is outside [-90, 90]", point.latitude),
        ));
    }
    if !(-180.0..=180.0).contains(&point.longitude) {
        return Some((
            ViolationKind::LongitudeOutOfRange,
            format!("longitude {} is outside [-180, 180]", point.longitude),
        ));
    }
    if let Label::Class(name) = &point.label {
        if !known.is_empty() && !known.contains(name.as_str()) {
            return Some((
                ViolationKind::UnknownLabel,
                format!("label '{name}' is not a known category"),
            ));
        }
    }
    None
}

/// Validates and deduplicates `datasets`, given in registration order.
///
/// Points sharing an id collapse to one; the later dataset wins, and inside a
/// dataset the later row wins. Rejected rows never abort the run: they are
/// collected on the returned [`Consolidation`].
pub fn consolidate(datasets: &[LabeledDataset], settings: &Settings) -> Consolidation {
    let known: HashSet<&str> = settings
        .labels
        .categories
        .iter()
        .map(String::as_str)
        .collect();

    let mut violations = Vec::new();
    let mut merged: BTreeMap<PointId, LabeledPoint> = BTreeMap::new();
    let mut accepted = 0usize;
    let mut input_points = 0usize;

    for dataset in datasets {
        input_points += dataset.len() + dataset.row_issues().len();

        let mut found: Vec<Violation> = dataset
            .row_issues()
            .iter()
            .map(|issue| Violation {
                dataset: dataset.name().to_string(),
                row: issue.row,
                point_id: None,
                kind: ViolationKind::UnreadableRow,
                message: issue.message.clone(),
            })
            .collect();

        for point in dataset.points() {
            match check_point(point, &known) {
                Some((kind, message)) => found.push(Violation {
                    dataset: dataset.name().to_string(),
                    row: point.row,
                    point_id: Some(point.id.clone()),
                    kind,
                    message,
                }),
                None => {
                    accepted += 1;
                    merged.insert(point.id.clone(), point.clone());
                }
            }
        }

        found.sort_by_key(|violation| violation.row);
        violations.extend(found);
    }

    let duplicates_collapsed = accepted - merged.len();
    if !violations.is_empty() {
        warn!(
            violations = violations.len(),
            "consolidation rejected rows"
        );
    }
    info!(
        datasets = datasets.len(),
        points = merged.len(),
        duplicates_collapsed,
        "consolidated datasets"
    );

    let provenance = Provenance::Consolidated {
        inputs: datasets.iter().map(LabeledDataset::snapshot_ref).collect(),
        consolidated_at: Utc::now(),
    };
    let dataset = LabeledDataset::new(
        CONSOLIDATED_NAME,
        merged.into_values().collect(),
        provenance,
        Vec::new(),
    );

    Consolidation {
        dataset,
        violations,
        input_points,
        duplicates_collapsed,
    }
}
