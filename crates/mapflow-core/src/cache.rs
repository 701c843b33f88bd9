use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::{CacheError, PipelineError};
use crate::fetch::{FetchAdapter, FetchError, FetchResult, FetchStatus, Scene};
use crate::object_store::{ObjectStore, PutOutcome};
use crate::settings::{Settings, SplitSettings};
use crate::shape::{normalize, FeatureVector, Normalized, ShapePolicy, Timeline};
use crate::split::assign_subset;
use crate::types::{DateRange, LabeledPoint, PointId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(
        point_id: &PointId,
        range: &DateRange,
        provider_version: &str,
        bands: &[String],
    ) -> Self {
        let start = range.start.to_string();
        let end = range.end.to_string();
        let bands = bands.join(",");

        let mut hasher = Hasher::new();
        for part in [
            point_id.as_str(),
            start.as_str(),
            end.as_str(),
            provider_version,
            bands.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(&[0]);
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Accepts a 64-character lowercase hex digest.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == 64
            && value
                .chars()
                .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn complete_key(&self) -> String {
        ObjectStore::cache_entry_key(&self.0, false)
    }

    pub fn partial_key(&self) -> String {
        ObjectStore::cache_entry_key(&self.0, true)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted result of one successful (complete or partial) fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: CacheKey,
    pub point_id: PointId,
    pub date_range: DateRange,
    pub provider_version: String,
    pub bands: Vec<String>,
    pub status: FetchStatus,
    pub observed_slots: usize,
    pub scenes: Vec<Scene>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Complete(CacheEntry),
    Partial(CacheEntry),
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Cache,
    Provider,
}

/// What the cache produced for one point.
#[derive(Debug, Clone, PartialEq)]
pub enum PointFeatures {
    Ready {
        vector: FeatureVector,
        origin: Origin,
    },
    /// Data exists but too few slots were observed to shape a vector.
    Insufficient {
        cache_key: CacheKey,
        status: FetchStatus,
        observed: usize,
        origin: Origin,
    },
    Failed {
        cache_key: CacheKey,
        error: FetchError,
        attempts: u32,
    },
}

/// Content-addressed, write-once store of fetched time series.
///
/// Reads take no lock. Commits for a key are serialized in-process by a
/// per-key async mutex; across processes the hard-link commit in
/// [`ObjectStore::put_new`] decides the winner.
pub struct FeatureCache {
    store: ObjectStore,
    provider_version: String,
    retry_partial: bool,
    policy: ShapePolicy,
    split: SplitSettings,
    locks: Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
}

impl FeatureCache {
    pub fn new(store: ObjectStore, settings: &Settings) -> Self {
        Self::with_provider_version(store, settings, &settings.provider_version)
    }

    pub fn with_provider_version(
        store: ObjectStore,
        settings: &Settings,
        provider_version: &str,
    ) -> Self {
        Self {
            store,
            provider_version: provider_version.to_string(),
            retry_partial: settings.cache.retry_partial,
            policy: ShapePolicy::from_settings(settings),
            split: settings.split.clone(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider_version(&self) -> &str {
        &self.provider_version
    }

    pub fn key_for(&self, point_id: &PointId, range: &DateRange) -> CacheKey {
        CacheKey::derive(point_id, range, &self.provider_version, &self.policy.bands)
    }

    pub fn lookup(&self, key: &CacheKey) -> Result<CacheLookup, PipelineError> {
        if let Some(entry) = self.read_entry(&key.complete_key(), key)? {
            return Ok(CacheLookup::Complete(entry));
        }
        if let Some(entry) = self.read_entry(&key.partial_key(), key)? {
            return Ok(CacheLookup::Partial(entry));
        }
        Ok(CacheLookup::Miss)
    }

    pub fn needs_fetch(&self, lookup: &CacheLookup) -> bool {
        match lookup {
            CacheLookup::Complete(_) => false,
            CacheLookup::Partial(_) => self.retry_partial,
            CacheLookup::Miss => true,
        }
    }

    fn read_entry(&self, object_key: &str, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let bytes = self.store.get(object_key).map_err(|source| CacheError::Read {
            key: key.to_string(),
            source,
        })?;
        bytes
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|source| CacheError::Corrupt {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    fn lock_for(&self, key: &CacheKey) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drops the map's lock for `key` once no other commit holds or awaits it.
    fn release(&self, key: &CacheKey, lock: Arc<AsyncMutex<()>>) {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn pending_locks(&self) -> usize {
        match self.locks.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn entry_from_result(
        &self,
        key: &CacheKey,
        range: &DateRange,
        result: &FetchResult,
    ) -> Option<CacheEntry> {
        if result.status == FetchStatus::Failed {
            return None;
        }
        Some(CacheEntry {
            cache_key: key.clone(),
            point_id: result.point_id.clone(),
            date_range: *range,
            provider_version: self.provider_version.clone(),
            bands: self.policy.bands.clone(),
            status: result.status,
            observed_slots: result.observed_slots,
            scenes: result.scenes.clone(),
            fetched_at: Utc::now(),
        })
    }

    /// Persists `entry` unless its slot is already taken, and returns the
    /// entry now on disk. A complete entry already present always wins; a
    /// partial never overwrites an earlier partial.
    pub async fn commit(&self, entry: CacheEntry) -> Result<CacheEntry, PipelineError> {
        let key = entry.cache_key.clone();
        let lock = self.lock_for(&key);
        let committed = {
            let _guard = lock.lock().await;
            self.commit_locked(&key, entry)
        };
        self.release(&key, lock);
        committed
    }

    fn commit_locked(&self, key: &CacheKey, entry: CacheEntry) -> Result<CacheEntry, PipelineError> {
        if let Some(existing) = self.read_entry(&key.complete_key(), key)? {
            return Ok(existing);
        }

        let object_key = match entry.status {
            FetchStatus::Complete => key.complete_key(),
            _ => key.partial_key(),
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;
        let outcome = self
            .store
            .put_new(&object_key, &bytes)
            .map_err(|source| CacheError::Write {
                key: key.to_string(),
                source,
            })?;

        match outcome {
            PutOutcome::Created => {
                debug!(cache_key = %key, status = %entry.status, "committed cache entry");
                Ok(entry)
            }
            PutOutcome::AlreadyExists => match self.read_entry(&object_key, key)? {
                Some(existing) => Ok(existing),
                None => Ok(entry),
            },
        }
    }

    /// Shapes a cached or freshly fetched entry into a feature vector.
    pub fn features_from_entry(
        &self,
        point: &LabeledPoint,
        entry: &CacheEntry,
        origin: Origin,
    ) -> PointFeatures {
        let timeline = Timeline::new(entry.date_range, self.policy.timesteps);
        match normalize(&entry.scenes, &timeline, &self.policy) {
            Normalized::Shaped { values, quality } => PointFeatures::Ready {
                vector: FeatureVector {
                    point_id: point.id.clone(),
                    label: point.label.clone(),
                    subset: assign_subset(&point.id, &self.split),
                    cache_key: entry.cache_key.clone(),
                    status: entry.status,
                    bands: self.policy.bands.clone(),
                    timesteps: self.policy.timesteps,
                    values,
                    quality,
                },
                origin,
            },
            Normalized::Insufficient { observed } => PointFeatures::Insufficient {
                cache_key: entry.cache_key.clone(),
                status: entry.status,
                observed,
                origin,
            },
        }
    }

    /// Turns a fetch result into features, committing it first. When a retry
    /// of a stale partial fails the stale entry is used instead.
    pub async fn absorb(
        &self,
        point: &LabeledPoint,
        key: &CacheKey,
        range: &DateRange,
        result: FetchResult,
        stale: Option<&CacheEntry>,
    ) -> Result<PointFeatures, PipelineError> {
        match self.entry_from_result(key, range, &result) {
            Some(entry) => {
                let stored = self.commit(entry).await?;
                Ok(self.features_from_entry(point, &stored, Origin::Provider))
            }
            None => match stale {
                Some(entry) => Ok(self.features_from_entry(point, entry, Origin::Cache)),
                None => Ok(PointFeatures::Failed {
                    cache_key: key.clone(),
                    error: result.error.unwrap_or(FetchError::NoUsableData),
                    attempts: result.attempts,
                }),
            },
        }
    }

    /// Returns cached features when a complete entry exists; otherwise
    /// delegates to the adapter, persists what it returns, and shapes it.
    pub async fn get_or_fetch(
        &self,
        point: &LabeledPoint,
        range: &DateRange,
        adapter: &FetchAdapter<'_>,
    ) -> Result<PointFeatures, PipelineError> {
        let key = self.key_for(&point.id, range);
        let stale = match self.lookup(&key)? {
            CacheLookup::Complete(entry) => {
                return Ok(self.features_from_entry(point, &entry, Origin::Cache));
            }
            CacheLookup::Partial(entry) if !self.retry_partial => {
                return Ok(self.features_from_entry(point, &entry, Origin::Cache));
            }
            CacheLookup::Partial(entry) => Some(entry),
            CacheLookup::Miss => None,
        };
        info!(point_id = %point.id, cache_key = %key, "cache miss; fetching");
        let result = adapter.fetch(point, range).await?;
        self.absorb(point, &key, range, result, stale.as_ref()).await
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn entry(cache: &FeatureCache, point: &str) -> CacheEntry {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 2, 1).unwrap(),
        );
        let point_id = PointId::from(point);
        CacheEntry {
            cache_key: cache.key_for(&point_id, &range),
            point_id,
            date_range: range,
            provider_version: cache.provider_version().to_string(),
            bands: vec!["B4".to_string()],
            status: FetchStatus::Complete,
            observed_slots: 0,
            scenes: Vec::new(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_locks_are_released_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 2, 1).unwrap(),
        );
        let settings = Settings::new("locks", dir.path(), range);
        let store = ObjectStore::open(dir.path()).unwrap();
        let cache = FeatureCache::new(store, &settings);

        let (a, b) = (entry(&cache, "a"), entry(&cache, "b"));
        let again = a.clone();
        let (first, second, third) =
            tokio::join!(cache.commit(a), cache.commit(b), cache.commit(again));

        assert_eq!(first.unwrap(), third.unwrap());
        second.unwrap();
        assert_eq!(cache.pending_locks(), 0);
    }
}
