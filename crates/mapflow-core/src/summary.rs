use std::collections::BTreeMap;

use serde::Serialize;

use crate::settings::SplitSettings;
use crate::split::{assign_subset, Subset};
use crate::types::LabeledDataset;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetSummary {
    pub name: String,
    pub snapshot_hash: String,
    pub points: usize,
    pub row_issues: usize,
    /// Keyed by label; unlabeled points count under `unlabeled`.
    pub by_label: BTreeMap<String, usize>,
    pub by_subset: BTreeMap<Subset, usize>,
    pub by_source: BTreeMap<String, usize>,
}

impl DatasetSummary {
    pub fn from_dataset(dataset: &LabeledDataset, split: &SplitSettings) -> Self {
        let mut summary = DatasetSummary {
            name: dataset.name().to_string(),
            snapshot_hash: dataset.snapshot_hash().to_string(),
            points: dataset.len(),
            row_issues: dataset.row_issues().len(),
            ..Default::default()
        };

        for point in dataset.points() {
            *summary.by_label.entry(point.label.to_string()).or_default() += 1;
            *summary
                .by_subset
                .entry(assign_subset(&point.id, split))
                .or_default() += 1;
            *summary
                .by_source
                .entry(point.source_dataset.clone())
                .or_default() += 1;
        }

        summary
    }

    pub fn labeled(&self) -> usize {
        self.points - self.by_label.get("unlabeled").copied().unwrap_or(0)
    }
}
