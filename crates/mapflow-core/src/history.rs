use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PipelineError;
use crate::object_store::ObjectStore;
use crate::types::PointId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub point_id: PointId,
    pub provider_version: String,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Permanently refused by the provider; never requested again.
    pub rejected: bool,
    pub flagged_for_review: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Rejected(String),
    UnderReview { failures: u32 },
}

/// Per-point failure ledger, persisted at `fetch_history.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchHistory {
    records: BTreeMap<String, HistoryRecord>,
}

fn record_key(point_id: &PointId, provider_version: &str) -> String {
    format!("{point_id}@{provider_version}")
}

impl FetchHistory {
    pub fn load(store: &ObjectStore) -> Result<Self, PipelineError> {
        match store.get(ObjectStore::HISTORY_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, store: &ObjectStore) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        store.put_replace(ObjectStore::HISTORY_KEY, &bytes)?;
        Ok(())
    }

    pub fn get(&self, point_id: &PointId, provider_version: &str) -> Option<&HistoryRecord> {
        self.records.get(&record_key(point_id, provider_version))
    }

    pub fn records(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.values()
    }

    pub fn flagged(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.values().filter(|record| record.flagged_for_review)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn blocked(&self, point_id: &PointId, provider_version: &str) -> Option<BlockReason> {
        let record = self.get(point_id, provider_version)?;
        if record.rejected {
            Some(BlockReason::Rejected(
                record.last_error.clone().unwrap_or_default(),
            ))
        } else if record.flagged_for_review {
            Some(BlockReason::UnderReview {
                failures: record.consecutive_failures,
            })
        } else {
            None
        }
    }

    fn record_mut(&mut self, point_id: &PointId, provider_version: &str) -> &mut HistoryRecord {
        self.records
            .entry(record_key(point_id, provider_version))
            .or_insert_with(|| HistoryRecord {
                point_id: point_id.clone(),
                provider_version: provider_version.to_string(),
                consecutive_failures: 0,
                last_error: None,
                rejected: false,
                flagged_for_review: false,
                updated_at: Utc::now(),
            })
    }

    /// A usable fetch resets the failure streak.
    pub fn record_success(&mut self, point_id: &PointId, provider_version: &str) {
        self.records.remove(&record_key(point_id, provider_version));
    }

    /// Returns true when this failure pushed the point into manual review.
    pub fn record_failure(
        &mut self,
        point_id: &PointId,
        provider_version: &str,
        error: &str,
        review_threshold: u32,
    ) -> bool {
        let record = self.record_mut(point_id, provider_version);
        record.consecutive_failures += 1;
        record.last_error = Some(error.to_string());
        record.updated_at = Utc::now();

        let newly_flagged =
            !record.flagged_for_review && record.consecutive_failures >= review_threshold.max(1);
        if newly_flagged {
            record.flagged_for_review = true;
            warn!(
                point_id = %point_id,
                failures = record.consecutive_failures,
                "point flagged for manual review"
            );
        }
        newly_flagged
    }

    pub fn record_rejection(&mut self, point_id: &PointId, provider_version: &str, reason: &str) {
        let record = self.record_mut(point_id, provider_version);
        record.rejected = true;
        record.last_error = Some(reason.to_string());
        record.updated_at = Utc::now();
    }

    /// Drops the record so the point is fetched again on the next run.
    pub fn clear(&mut self, point_id: &PointId, provider_version: &str) -> Option<HistoryRecord> {
        self.records.remove(&record_key(point_id, provider_version))
    }

    /// Clears every record for `point_id` across provider versions.
    pub fn clear_point(&mut self, point_id: &PointId) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.point_id != *point_id);
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_after_threshold_and_success_resets() {
        let mut history = FetchHistory::default();
        let id = PointId::from("abc");

        assert!(!history.record_failure(&id, "v1", "timeout", 3));
        assert!(!history.record_failure(&id, "v1", "timeout", 3));
        assert!(history.blocked(&id, "v1").is_none());
        assert!(history.record_failure(&id, "v1", "timeout", 3));
        assert_eq!(
            history.blocked(&id, "v1"),
            Some(BlockReason::UnderReview { failures: 3 })
        );
        assert!(history.blocked(&id, "v2").is_none());

        history.record_success(&id, "v1");
        assert!(history.blocked(&id, "v1").is_none());
        assert!(history.is_empty());
    }

    #[test]
    fn rejections_block_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let id = PointId::from("def");

        let mut history = FetchHistory::default();
        history.record_rejection(&id, "v1", "outside coverage");
        history.save(&store).unwrap();

        let mut loaded = FetchHistory::load(&store).unwrap();
        assert_eq!(loaded, history);
        assert_eq!(
            loaded.blocked(&id, "v1"),
            Some(BlockReason::Rejected("outside coverage".to_string()))
        );
        assert!(loaded.clear(&id, "v1").is_some());
        assert!(loaded.blocked(&id, "v1").is_none());
    }
}
