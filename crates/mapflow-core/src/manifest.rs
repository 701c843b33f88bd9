use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::CacheKey;
use crate::error::PipelineError;
use crate::object_store::ObjectStore;
use crate::split::Subset;
use crate::types::{DateRange, PointId, SnapshotRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Succeeded,
    Partial,
    Failed,
    Excluded,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EntryStatus::Succeeded => "succeeded",
            EntryStatus::Partial => "partial",
            EntryStatus::Failed => "failed",
            EntryStatus::Excluded => "excluded",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub excluded: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, status: EntryStatus) {
        match status {
            EntryStatus::Succeeded => self.succeeded += 1,
            EntryStatus::Partial => self.partial += 1,
            EntryStatus::Failed => self.failed += 1,
            EntryStatus::Excluded => self.excluded += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.partial + self.failed + self.excluded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestShape {
    pub bands: Vec<String>,
    pub timesteps: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// `None` for unlabeled points.
    pub label: Option<String>,
    pub subset: Subset,
    pub status: EntryStatus,
    pub cache_key: CacheKey,
    pub observed_timesteps: usize,
    pub source_dataset: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFailure {
    pub point_id: PointId,
    pub status: EntryStatus,
    pub reason: String,
}

/// Description of one feature store build. Everything except `created_at`
/// is a function of the inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStoreManifest {
    pub version: String,
    pub project_name: String,
    /// Input snapshots in registration order; the order decides deduplication.
    pub dataset_snapshots: Vec<SnapshotRef>,
    pub consolidated_hash: String,
    pub provider_version: String,
    pub date_range: DateRange,
    pub shape: ManifestShape,
    pub point_count: usize,
    pub counts: OutcomeCounts,
    pub entries: BTreeMap<PointId, ManifestEntry>,
    pub failures: Vec<ManifestFailure>,
    pub review_flagged: Vec<PointId>,
    pub created_at: DateTime<Utc>,
}

impl FeatureStoreManifest {
    pub fn load(store: &ObjectStore, version: &str) -> Result<Option<Self>, PipelineError> {
        match store.get(&ObjectStore::manifest_key(version))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, store: &ObjectStore) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        store.put_replace(&ObjectStore::manifest_key(&self.version), &bytes)?;
        Ok(())
    }

    /// Object keys of every cache entry this build may read.
    pub fn referenced_objects(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .flat_map(|entry| [entry.cache_key.complete_key(), entry.cache_key.partial_key()])
            .collect()
    }

    /// Equal apart from `created_at`.
    pub fn same_build(&self, other: &Self) -> bool {
        let mut other = other.clone();
        other.created_at = self.created_at;
        *self == other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// No previous manifest for this version.
    Fresh,
    /// Same snapshots, provider version, range and shape as last time.
    UpToDate,
    /// Dataset snapshots, their order or the consolidated result changed;
    /// unchanged points are served from cache.
    Incremental,
    /// Provider version, date range or shape changed; every key is new.
    Full,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BuildMode::Fresh => "fresh",
            BuildMode::UpToDate => "up_to_date",
            BuildMode::Incremental => "incremental",
            BuildMode::Full => "full",
        };
        f.write_str(text)
    }
}

pub fn assess_build(
    previous: Option<&FeatureStoreManifest>,
    snapshots: &[SnapshotRef],
    consolidated_hash: &str,
    provider_version: &str,
    date_range: &DateRange,
    shape: &ManifestShape,
) -> BuildMode {
    let Some(previous) = previous else {
        return BuildMode::Fresh;
    };
    if previous.provider_version != provider_version
        || previous.date_range != *date_range
        || previous.shape != *shape
    {
        return BuildMode::Full;
    }
    if previous.dataset_snapshots == snapshots && previous.consolidated_hash == consolidated_hash {
        BuildMode::UpToDate
    } else {
        BuildMode::Incremental
    }
}
