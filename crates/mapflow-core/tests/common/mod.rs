#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use mapflow_core::fetch::{FetchPoint, ImageryProvider, PointResponse, PointResult, ProviderError, Scene};
use mapflow_core::registry::{DatasetRegistry, SourceConfig};
use mapflow_core::settings::Settings;
use mapflow_core::shape::Timeline;
use mapflow_core::types::{DateRange, LabeledDataset, PointId};

pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../mapflow-parser/tests/data")
        .join(name)
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// 100 days split into 10 slots of 10 days.
pub fn range() -> DateRange {
    DateRange::new(date(2021, 1, 1), date(2021, 4, 11))
}

pub fn bands() -> Vec<String> {
    vec!["B4".to_string(), "B8".to_string()]
}

pub fn test_settings(data_dir: &Path) -> Settings {
    let mut settings = Settings::new("test-project", data_dir, range());
    settings.shape.bands = bands();
    settings.shape.timesteps = 10;
    settings.shape.min_valid_timesteps = 6;
    settings.shape.max_gap_fill = 1;
    settings.batch_size = 2;
    settings.concurrency_limit = 2;
    settings.retry_count = 3;
    settings.retry.base_delay_ms = 1;
    settings.retry.max_delay_ms = 5;
    settings.validate().expect("test settings are valid");
    settings
}

/// One usable scene at the centre of each listed slot.
pub fn scenes_for_slots(slots: &[usize]) -> Vec<Scene> {
    let timeline = Timeline::new(range(), 10);
    slots
        .iter()
        .map(|slot| {
            let mut values = BTreeMap::new();
            for (offset, band) in bands().into_iter().enumerate() {
                values.insert(band, Some(*slot as f64 + offset as f64 * 100.0));
            }
            Scene {
                date: timeline.slot_centre(*slot),
                values,
            }
        })
        .collect()
}

pub fn full_series() -> Vec<Scene> {
    scenes_for_slots(&(0..10).collect::<Vec<_>>())
}

type Responder = Box<dyn Fn(&FetchPoint) -> PointResponse + Send + Sync>;

/// In-memory provider that answers from a closure and counts its calls.
pub struct ScriptedProvider {
    responder: Responder,
    batch_errors: Mutex<VecDeque<ProviderError>>,
    calls: AtomicUsize,
    points: AtomicUsize,
    requested: Mutex<Vec<PointId>>,
}

impl ScriptedProvider {
    pub fn new(responder: impl Fn(&FetchPoint) -> PointResponse + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            batch_errors: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            points: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn complete() -> Self {
        Self::new(|_| PointResponse::Series(full_series()))
    }

    /// Batch-level errors returned, in order, before any batch succeeds.
    pub fn with_errors(self, errors: Vec<ProviderError>) -> Self {
        *self.batch_errors.lock().unwrap() = errors.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Total points across every request, retries included.
    pub fn points_requested(&self) -> usize {
        self.points.load(Ordering::SeqCst)
    }

    pub fn requested_ids(&self) -> Vec<PointId> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageryProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn request(
        &self,
        points: &[FetchPoint],
        _range: &DateRange,
        _bands: &[String],
    ) -> Result<Vec<PointResult>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.points.fetch_add(points.len(), Ordering::SeqCst);
        self.requested
            .lock()
            .unwrap()
            .extend(points.iter().map(|point| point.id.clone()));

        if let Some(err) = self.batch_errors.lock().unwrap().pop_front() {
            return Err(err);
        }

        Ok(points
            .iter()
            .map(|point| PointResult {
                id: point.id.clone(),
                response: (self.responder)(point),
            })
            .collect())
    }
}

/// Registers inline CSV content as a dataset named `name`.
pub fn csv_dataset(settings: &Settings, name: &str, csv: &str) -> LabeledDataset {
    let mut registry = DatasetRegistry::new(settings);
    let source = SourceConfig::new(name, format!("{name}.csv"));
    registry
        .register_bytes(&source, name, Path::new(&source.path), csv.as_bytes())
        .expect("register inline csv");
    registry.into_datasets().remove(0)
}

pub fn grid_csv(count: usize) -> String {
    let mut csv = String::from("lat,lon,date,label\n");
    for index in 0..count {
        csv.push_str(&format!(
            "{}.0,{}.0,2021-01-15,{}\n",
            index,
            index + 10,
            if index % 2 == 0 { "maize" } else { "rice" }
        ));
    }
    csv
}
