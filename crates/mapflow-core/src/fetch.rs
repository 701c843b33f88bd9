use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::settings::Settings;
use crate::shape::Timeline;
use crate::types::{DateRange, LabeledPoint, PointId};

/// One acquisition for one point. Band values are `None` (or absent) when the
/// provider masked them, e.g. under cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub date: NaiveDate,
    pub values: BTreeMap<String, Option<f64>>,
}

impl Scene {
    /// Values for `bands` in order, or `None` unless every band is finite.
    pub fn band_values(&self, bands: &[String]) -> Option<Vec<f64>> {
        bands
            .iter()
            .map(|band| {
                self.values
                    .get(band)
                    .copied()
                    .flatten()
                    .filter(|value| value.is_finite())
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchPoint {
    pub id: PointId,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&LabeledPoint> for FetchPoint {
    fn from(point: &LabeledPoint) -> Self {
        Self {
            id: point.id.clone(),
            latitude: point.latitude,
            longitude: point.longitude,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PointResponse {
    Series(Vec<Scene>),
    /// Permanent: the point is outside coverage or otherwise refused.
    Rejected(String),
    /// Transient for this point only; worth retrying.
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointResult {
    pub id: PointId,
    pub response: PointResponse,
}

/// Batch-level provider failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait ImageryProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Time series for every point in `points` over `range`. Points missing
    /// from the response are treated as unavailable.
    async fn request(
        &self,
        points: &[FetchPoint],
        range: &DateRange,
        bands: &[String],
    ) -> Result<Vec<PointResult>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Complete,
    Partial,
    Failed,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStatus::Complete => f.write_str("complete"),
            FetchStatus::Partial => f.write_str("partial"),
            FetchStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FetchError {
    #[error("transient failure after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },
    #[error("rejected by provider: {0}")]
    Permanent(String),
    #[error("provider returned no usable scenes")]
    NoUsableData,
}

impl FetchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Permanent(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub point_id: PointId,
    pub status: FetchStatus,
    /// Empty when the fetch failed.
    pub scenes: Vec<Scene>,
    pub observed_slots: usize,
    pub error: Option<FetchError>,
    pub attempts: u32,
}

impl FetchResult {
    fn failed(point_id: PointId, error: FetchError, attempts: u32) -> Self {
        Self {
            point_id,
            status: FetchStatus::Failed,
            scenes: Vec::new(),
            observed_slots: 0,
            error: Some(error),
            attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            attempts: settings.retry_count.max(1),
            base_delay: Duration::from_millis(settings.retry.base_delay_ms),
            max_delay: Duration::from_millis(settings.retry.max_delay_ms),
        }
    }

    /// Wait before the attempt following failed attempt `failed` (1-based):
    /// `base * 2^(failed - 1)` capped at `max_delay`, or `retry_after` when larger.
    pub fn delay(&self, failed: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(failed.saturating_sub(1));
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        match retry_after {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }
}

/// Calls the provider in batches and classifies what comes back.
pub struct FetchAdapter<'a> {
    provider: &'a dyn ImageryProvider,
    bands: Vec<String>,
    timesteps: usize,
    batch_size: usize,
    retry: RetryPolicy,
}

impl<'a> FetchAdapter<'a> {
    pub fn new(provider: &'a dyn ImageryProvider, settings: &Settings) -> Self {
        Self {
            provider,
            bands: settings.shape.bands.clone(),
            timesteps: settings.shape.timesteps,
            batch_size: settings.batch_size.max(1),
            retry: RetryPolicy::from_settings(settings),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn classify(&self, scenes: &[Scene], range: &DateRange) -> (FetchStatus, usize) {
        let timeline = Timeline::new(*range, self.timesteps);
        let observed = timeline.observed_slots(scenes, &self.bands);
        let status = if observed == 0 {
            FetchStatus::Failed
        } else if observed == self.timesteps {
            FetchStatus::Complete
        } else {
            FetchStatus::Partial
        };
        (status, observed)
    }

    pub async fn fetch(
        &self,
        point: &LabeledPoint,
        range: &DateRange,
    ) -> Result<FetchResult, PipelineError> {
        let mut results = self.fetch_batch(&[FetchPoint::from(point)], range).await?;
        results
            .pop()
            .ok_or_else(|| PipelineError::ProviderUnreachable("empty fetch result".to_string()))
    }

    /// One result per input point, in input order. Points that stay
    /// unavailable are retried as a smaller batch within the same attempt
    /// budget. `Unreachable` on the final attempt aborts with
    /// [`PipelineError::ProviderUnreachable`].
    pub async fn fetch_batch(
        &self,
        points: &[FetchPoint],
        range: &DateRange,
    ) -> Result<Vec<FetchResult>, PipelineError> {
        let mut resolved: HashMap<PointId, FetchResult> = HashMap::with_capacity(points.len());
        let mut pending: Vec<FetchPoint> = points.to_vec();
        let mut last_message: HashMap<PointId, String> = HashMap::new();
        let mut wait = None;

        for attempt in 1..=self.retry.attempts {
            if pending.is_empty() {
                break;
            }
            if let Some(delay) = wait.take() {
                tokio::time::sleep(delay).await;
            }

            debug!(
                provider = self.provider.name(),
                attempt,
                points = pending.len(),
                "requesting time series"
            );

            match self.provider.request(&pending, range, &self.bands).await {
                Ok(responses) => {
                    let mut by_id: HashMap<PointId, PointResponse> = responses
                        .into_iter()
                        .map(|result| (result.id, result.response))
                        .collect();

                    let mut still_pending = Vec::new();
                    for point in pending {
                        match by_id.remove(&point.id) {
                            Some(PointResponse::Series(scenes)) => {
                                let result = self.series_result(&point.id, scenes, range, attempt);
                                resolved.insert(point.id.clone(), result);
                            }
                            Some(PointResponse::Rejected(reason)) => {
                                resolved.insert(
                                    point.id.clone(),
                                    FetchResult::failed(
                                        point.id.clone(),
                                        FetchError::Permanent(reason),
                                        attempt,
                                    ),
                                );
                            }
                            Some(PointResponse::Unavailable(reason)) => {
                                last_message.insert(point.id.clone(), reason);
                                still_pending.push(point);
                            }
                            None => {
                                last_message.insert(
                                    point.id.clone(),
                                    "point missing from provider response".to_string(),
                                );
                                still_pending.push(point);
                            }
                        }
                    }
                    pending = still_pending;
                    wait = Some(self.retry.delay(attempt, None));
                }
                Err(ProviderError::Unreachable(message)) if attempt == self.retry.attempts => {
                    return Err(PipelineError::ProviderUnreachable(format!(
                        "{} after {attempt} attempt(s): {message}",
                        self.provider.name()
                    )));
                }
                Err(err) => {
                    warn!(
                        provider = self.provider.name(),
                        attempt,
                        error = %err,
                        "provider request failed"
                    );
                    let retry_after = match &err {
                        ProviderError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    for point in &pending {
                        last_message.insert(point.id.clone(), err.to_string());
                    }
                    wait = Some(self.retry.delay(attempt, retry_after));
                }
            }
        }

        for point in pending {
            let message = last_message
                .remove(&point.id)
                .unwrap_or_else(|| "no response".to_string());
            resolved.insert(
                point.id.clone(),
                FetchResult::failed(
                    point.id.clone(),
                    FetchError::Transient {
                        attempts: self.retry.attempts,
                        message,
                    },
                    self.retry.attempts,
                ),
            );
        }

        Ok(points
            .iter()
            .filter_map(|point| resolved.remove(&point.id))
            .collect())
    }

    fn series_result(
        &self,
        id: &PointId,
        scenes: Vec<Scene>,
        range: &DateRange,
        attempt: u32,
    ) -> FetchResult {
        let (status, observed_slots) = self.classify(&scenes, range);
        if status == FetchStatus::Failed {
            return FetchResult::failed(id.clone(), FetchError::NoUsableData, attempt);
        }
        FetchResult {
            point_id: id.clone(),
            status,
            scenes,
            observed_slots,
            error: None,
            attempts: attempt,
        }
    }
}
