use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{error, info, info_span, warn, Instrument};

use crate::cache::{CacheEntry, CacheKey, CacheLookup, FeatureCache, Origin, PointFeatures};
use crate::error::PipelineError;
use crate::fetch::{FetchAdapter, FetchError, FetchPoint, FetchStatus, ImageryProvider};
use crate::history::{BlockReason, FetchHistory};
use crate::manifest::{
    assess_build, BuildMode, EntryStatus, FeatureStoreManifest, ManifestEntry, ManifestFailure,
    ManifestShape, OutcomeCounts,
};
use crate::outputs::write_features;
use crate::registry::{DatasetRegistry, RegistrationReport};
use crate::settings::Settings;
use crate::shape::FeatureVector;
use crate::split::assign_subset;
use crate::types::{DateRange, LabeledDataset, LabeledPoint, PointId, SnapshotRef};
use crate::validation::{consolidate, Violation};

/// Cooperative cancellation shared between the caller and a running build.
/// Once cancelled (or past the deadline) no new fetch batch is issued.
#[derive(Debug, Default)]
pub struct RunControl {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        match settings.run_timeout_secs {
            Some(secs) => Self::with_timeout(Duration::from_secs(secs)),
            None => Self::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub manifest: FeatureStoreManifest,
    pub vectors: Vec<FeatureVector>,
    pub build_mode: BuildMode,
    pub violations: Vec<Violation>,
    pub duplicates_collapsed: usize,
    pub cache_hits: usize,
    /// Points handed to the provider.
    pub fetches_issued: usize,
    pub cancelled: bool,
}

#[derive(Debug)]
pub struct PipelineRun {
    pub registration: RegistrationReport,
    pub build: BuildOutcome,
}

struct PlannedFetch<'p> {
    point: &'p LabeledPoint,
    key: CacheKey,
    stale: Option<CacheEntry>,
}

enum Resolution {
    Features(PointFeatures),
    Blocked(BlockReason),
    Cancelled,
}

struct BatchDone<'p> {
    issued: usize,
    points: Vec<(PlannedFetch<'p>, Resolution, Option<FetchError>)>,
}

async fn run_batch<'p>(
    index: usize,
    batch: Vec<PlannedFetch<'p>>,
    adapter: &FetchAdapter<'_>,
    cache: &FeatureCache,
    range: &DateRange,
    control: &RunControl,
) -> Result<BatchDone<'p>, PipelineError> {
    if control.is_cancelled() {
        return Ok(BatchDone {
            issued: 0,
            points: batch
                .into_iter()
                .map(|planned| (planned, Resolution::Cancelled, None))
                .collect(),
        });
    }

    let request: Vec<FetchPoint> = batch.iter().map(|planned| planned.point.into()).collect();
    let results = adapter
        .fetch_batch(&request, range)
        .instrument(info_span!("fetch_batch", batch = index, points = request.len()))
        .await?;

    let mut by_id: BTreeMap<PointId, _> = results
        .into_iter()
        .map(|result| (result.point_id.clone(), result))
        .collect();

    let issued = batch.len();
    let mut points = Vec::with_capacity(issued);
    for planned in batch {
        let Some(result) = by_id.remove(&planned.point.id) else {
            let failed = PointFeatures::Failed {
                cache_key: planned.key.clone(),
                error: FetchError::NoUsableData,
                attempts: 0,
            };
            points.push((planned, Resolution::Features(failed), Some(FetchError::NoUsableData)));
            continue;
        };
        let error = result.error.clone();
        let features = cache
            .absorb(
                planned.point,
                &planned.key,
                range,
                result,
                planned.stale.as_ref(),
            )
            .await?;
        // A failed retry that fell back to the stale partial is not a failure.
        let error = match &features {
            PointFeatures::Failed { .. } => error,
            _ => None,
        };
        points.push((planned, Resolution::Features(features), error));
    }

    Ok(BatchDone { issued, points })
}

struct Accumulator<'s> {
    settings: &'s Settings,
    provider_version: &'s str,
    timesteps: usize,
    entries: BTreeMap<PointId, ManifestEntry>,
    reasons: BTreeMap<PointId, String>,
    vectors: Vec<FeatureVector>,
    counts: OutcomeCounts,
    cache_hits: usize,
    fetches_issued: usize,
}

impl<'s> Accumulator<'s> {
    fn record(
        &mut self,
        point: &LabeledPoint,
        key: &CacheKey,
        resolution: Resolution,
        history: Option<(&mut FetchHistory, Option<FetchError>)>,
    ) {
        let (status, observed, reason) = match resolution {
            Resolution::Features(PointFeatures::Ready { vector, origin }) => {
                if origin == Origin::Cache {
                    self.cache_hits += 1;
                }
                let status = match vector.status {
                    FetchStatus::Complete => EntryStatus::Succeeded,
                    _ => EntryStatus::Partial,
                };
                let observed = vector.observed_timesteps();
                self.vectors.push(vector);
                (status, observed, None)
            }
            Resolution::Features(PointFeatures::Insufficient {
                observed, origin, ..
            }) => {
                if origin == Origin::Cache {
                    self.cache_hits += 1;
                }
                (
                    EntryStatus::Excluded,
                    observed,
                    Some(format!(
                        "only {observed} of {} timesteps observed",
                        self.timesteps
                    )),
                )
            }
            Resolution::Features(PointFeatures::Failed { error, .. }) => {
                let status = if error.is_permanent() {
                    EntryStatus::Excluded
                } else {
                    EntryStatus::Failed
                };
                (status, 0, Some(error.to_string()))
            }
            Resolution::Blocked(BlockReason::Rejected(reason)) => (
                EntryStatus::Excluded,
                0,
                Some(format!("rejected by provider: {reason}")),
            ),
            Resolution::Blocked(BlockReason::UnderReview { failures }) => (
                EntryStatus::Excluded,
                0,
                Some(format!(
                    "flagged for manual review after {failures} consecutive failures"
                )),
            ),
            Resolution::Cancelled => (
                EntryStatus::Excluded,
                0,
                Some("cancelled before fetch".to_string()),
            ),
        };

        if let Some((history, error)) = history {
            match error {
                Some(FetchError::Permanent(reason)) => {
                    history.record_rejection(&point.id, self.provider_version, &reason);
                }
                Some(error) => {
                    history.record_failure(
                        &point.id,
                        self.provider_version,
                        &error.to_string(),
                        self.settings.failure_review_threshold,
                    );
                }
                None => history.record_success(&point.id, self.provider_version),
            }
        }

        self.counts.record(status);
        if let Some(reason) = reason {
            self.reasons.insert(point.id.clone(), reason);
        }
        self.entries.insert(
            point.id.clone(),
            ManifestEntry {
                label: point.label.class_name().map(str::to_string),
                subset: assign_subset(&point.id, &self.settings.split),
                status,
                cache_key: key.clone(),
                observed_timesteps: observed,
                source_dataset: point.source_dataset.clone(),
            },
        );
    }
}

/// Consolidates `datasets`, serves or fetches every point's time series, and
/// writes `features/<feature_store_version>/{features.parquet,manifest.json}`.
///
/// Per-point fetch failures never fail the build; they are counted and listed
/// in the manifest. A cache write failure or an unreachable provider aborts
/// the run after persisting the fetch history; cache entries committed so far
/// are kept.
pub async fn create_features(
    settings: &Settings,
    datasets: &[LabeledDataset],
    date_range: &DateRange,
    provider_version: &str,
    provider: &dyn ImageryProvider,
    control: &RunControl,
) -> Result<BuildOutcome, PipelineError> {
    let store = settings.layout().open_store()?;
    let consolidation = consolidate(datasets, settings);
    let points = consolidation.dataset.points();

    let snapshots: Vec<SnapshotRef> = datasets.iter().map(LabeledDataset::snapshot_ref).collect();
    let shape = ManifestShape {
        bands: settings.shape.bands.clone(),
        timesteps: settings.shape.timesteps,
    };
    let previous = FeatureStoreManifest::load(&store, &settings.feature_store_version)?;
    let build_mode = assess_build(
        previous.as_ref(),
        &snapshots,
        consolidation.dataset.snapshot_hash(),
        provider_version,
        date_range,
        &shape,
    );
    info!(
        version = %settings.feature_store_version,
        provider_version,
        points = points.len(),
        mode = %build_mode,
        "starting feature build"
    );

    let cache = FeatureCache::with_provider_version(store.clone(), settings, provider_version);
    let mut history = FetchHistory::load(&store)?;
    let mut acc = Accumulator {
        settings,
        provider_version,
        timesteps: settings.shape.timesteps,
        entries: BTreeMap::new(),
        reasons: BTreeMap::new(),
        vectors: Vec::with_capacity(points.len()),
        counts: OutcomeCounts::default(),
        cache_hits: 0,
        fetches_issued: 0,
    };

    let mut to_fetch = Vec::new();
    for point in points {
        let key = cache.key_for(&point.id, date_range);
        let lookup = cache.lookup(&key)?;
        if let Some(reason) = history.blocked(&point.id, provider_version) {
            let resolution = match &lookup {
                CacheLookup::Complete(entry) | CacheLookup::Partial(entry) => {
                    Resolution::Features(cache.features_from_entry(point, entry, Origin::Cache))
                }
                CacheLookup::Miss => Resolution::Blocked(reason),
            };
            acc.record(point, &key, resolution, None);
            continue;
        }
        if !cache.needs_fetch(&lookup) {
            if let CacheLookup::Complete(entry) | CacheLookup::Partial(entry) = &lookup {
                let features = cache.features_from_entry(point, entry, Origin::Cache);
                acc.record(point, &key, Resolution::Features(features), None);
                continue;
            }
        }
        let stale = match lookup {
            CacheLookup::Partial(entry) => Some(entry),
            _ => None,
        };
        to_fetch.push(PlannedFetch { point, key, stale });
    }

    let adapter = FetchAdapter::new(provider, settings);
    let mut batches: Vec<Vec<PlannedFetch<'_>>> = Vec::new();
    let mut pending = to_fetch.into_iter().peekable();
    while pending.peek().is_some() {
        batches.push(pending.by_ref().take(adapter.batch_size()).collect());
    }
    info!(
        cache_hits = acc.cache_hits,
        to_fetch = batches.iter().map(Vec::len).sum::<usize>(),
        batches = batches.len(),
        "planned fetches"
    );

    let adapter_ref = &adapter;
    let cache_ref = &cache;
    let mut fatal = None;
    {
        let mut running = stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| {
                run_batch(index, batch, adapter_ref, cache_ref, date_range, control)
            })
            .buffer_unordered(settings.concurrency_limit.max(1));

        while let Some(done) = running.next().await {
            match done {
                Ok(done) => {
                    acc.fetches_issued += done.issued;
                    for (planned, resolution, error) in done.points {
                        let history = match resolution {
                            Resolution::Cancelled => None,
                            _ => Some((&mut history, error)),
                        };
                        acc.record(planned.point, &planned.key, resolution, history);
                    }
                }
                Err(err) => {
                    error!(error = %err, "aborting feature build");
                    fatal = Some(err);
                    break;
                }
            }
        }
    }

    history.save(&store)?;
    if let Some(err) = fatal {
        return Err(err);
    }

    let cancelled = control.is_cancelled();
    if cancelled {
        warn!(
            excluded = acc.counts.excluded,
            "build cancelled; unfetched points excluded"
        );
    }

    let failures: Vec<ManifestFailure> = acc
        .reasons
        .iter()
        .filter_map(|(point_id, reason)| {
            acc.entries.get(point_id).map(|entry| ManifestFailure {
                point_id: point_id.clone(),
                status: entry.status,
                reason: reason.clone(),
            })
        })
        .collect();
    let review_flagged: Vec<PointId> = history
        .flagged()
        .filter(|record| record.provider_version == provider_version)
        .filter(|record| acc.entries.contains_key(&record.point_id))
        .map(|record| record.point_id.clone())
        .collect();

    acc.vectors.sort_by(|a, b| a.point_id.cmp(&b.point_id));
    let manifest = FeatureStoreManifest {
        version: settings.feature_store_version.clone(),
        project_name: settings.project_name.clone(),
        dataset_snapshots: snapshots,
        consolidated_hash: consolidation.dataset.snapshot_hash().to_string(),
        provider_version: provider_version.to_string(),
        date_range: *date_range,
        shape,
        point_count: points.len(),
        counts: acc.counts,
        entries: acc.entries,
        failures,
        review_flagged,
        created_at: Utc::now(),
    };
    debug_assert_eq!(manifest.counts.total(), manifest.point_count);

    write_features(&store, &manifest.version, &acc.vectors)?;
    manifest.save(&store)?;
    info!(
        succeeded = manifest.counts.succeeded,
        partial = manifest.counts.partial,
        failed = manifest.counts.failed,
        excluded = manifest.counts.excluded,
        fetches = acc.fetches_issued,
        "feature build finished"
    );

    Ok(BuildOutcome {
        manifest,
        vectors: acc.vectors,
        build_mode,
        violations: consolidation.violations,
        duplicates_collapsed: consolidation.duplicates_collapsed,
        cache_hits: acc.cache_hits,
        fetches_issued: acc.fetches_issued,
        cancelled,
    })
}

/// Registers every declared source, then builds with the configured range
/// and provider version.
pub async fn create_features_from_settings(
    settings: &Settings,
    provider: &dyn ImageryProvider,
    control: &RunControl,
) -> Result<PipelineRun, PipelineError> {
    let mut registry = DatasetRegistry::new(settings);
    let registration = registry.register_all(&settings.datasets);

    let build = create_features(
        settings,
        registry.datasets(),
        &settings.date_range,
        &settings.provider_version,
        provider,
        control,
    )
    .await?;

    Ok(PipelineRun {
        registration,
        build,
    })
}
