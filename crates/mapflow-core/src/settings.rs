use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::object_store::{ObjectStore, StoreError};
use crate::registry::SourceConfig;
use crate::types::DateRange;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupSettings {
    /// Decimal places kept when deriving point ids.
    #[serde(default = "default_coordinate_precision")]
    pub coordinate_precision: u32,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            coordinate_precision: default_coordinate_precision(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShapeSettings {
    #[serde(default = "default_bands")]
    pub bands: Vec<String>,
    #[serde(default = "default_timesteps")]
    pub timesteps: usize,
    #[serde(default = "default_min_valid_timesteps")]
    pub min_valid_timesteps: usize,
    /// Longest run of empty slots filled from the nearest observed neighbour.
    #[serde(default = "default_max_gap_fill")]
    pub max_gap_fill: usize,
}

impl Default for ShapeSettings {
    fn default() -> Self {
        Self {
            bands: default_bands(),
            timesteps: default_timesteps(),
            min_valid_timesteps: default_min_valid_timesteps(),
            max_gap_fill: default_max_gap_fill(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheSettings {
    #[serde(default)]
    pub retry_partial: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LabelSettings {
    /// Known categories; empty accepts any non-empty label.
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SplitSettings {
    #[serde(default)]
    pub validation: f64,
    #[serde(default)]
    pub testing: f64,
}

/// Immutable run configuration. Every component receives it by reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub project_name: String,
    pub data_directory: PathBuf,
    pub feature_store_version: String,
    pub provider_version: String,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Total provider attempts per batch, including the first.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    pub date_range: DateRange,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default)]
    pub shape: ShapeSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default = "default_failure_review_threshold")]
    pub failure_review_threshold: u32,
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default)]
    pub labels: LabelSettings,
    #[serde(default)]
    pub split: SplitSettings,
    #[serde(default)]
    pub datasets: Vec<SourceConfig>,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Settings {
    /// Defaults for every optional knob.
    pub fn new(
        project_name: impl Into<String>,
        data_directory: impl Into<PathBuf>,
        date_range: DateRange,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            data_directory: data_directory.into(),
            feature_store_version: "v1".to_string(),
            provider_version: "v1".to_string(),
            concurrency_limit: default_concurrency_limit(),
            retry_count: default_retry_count(),
            date_range,
            batch_size: default_batch_size(),
            retry: RetrySettings::default(),
            dedup: DedupSettings::default(),
            shape: ShapeSettings::default(),
            cache: CacheSettings::default(),
            failure_review_threshold: default_failure_review_threshold(),
            run_timeout_secs: None,
            labels: LabelSettings::default(),
            split: SplitSettings::default(),
            datasets: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }

    /// Parses and validates. Relative paths resolve against the current directory.
    pub fn from_toml_str(contents: &str) -> Result<Self, SettingsError> {
        let mut settings: Settings = toml::from_str(contents)?;
        settings.base_dir = PathBuf::from(".");
        settings.validate()?;
        Ok(settings)
    }

    /// Relative paths in the file resolve against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings = Self::from_toml_str(&contents)?;
        settings.base_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.project_name.trim().is_empty() {
            return Err(invalid("project_name", "must not be empty"));
        }
        check_path_component("feature_store_version", &self.feature_store_version)?;
        if self.provider_version.trim().is_empty() {
            return Err(invalid("provider_version", "must not be empty"));
        }
        if self.concurrency_limit == 0 {
            return Err(invalid("concurrency_limit", "must be at least 1"));
        }
        if self.retry_count == 0 {
            return Err(invalid("retry_count", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.dedup.coordinate_precision > 9 {
            return Err(invalid(
                "dedup.coordinate_precision",
                "at most 9 decimal places are supported",
            ));
        }

        let range = &self.date_range;
        if range.start >= range.end {
            return Err(invalid(
                "date_range",
                format!("start {} must be before end {}", range.start, range.end),
            ));
        }

        let shape = &self.shape;
        if shape.timesteps == 0 {
            return Err(invalid("shape.timesteps", "must be at least 1"));
        }
        if range.num_days() < shape.timesteps as i64 {
            return Err(invalid(
                "shape.timesteps",
                format!(
                    "{} slots do not fit in a {}-day date range",
                    shape.timesteps,
                    range.num_days()
                ),
            ));
        }
        if shape.min_valid_timesteps > shape.timesteps {
            return Err(invalid(
                "shape.min_valid_timesteps",
                "must not exceed shape.timesteps",
            ));
        }
        if shape.bands.is_empty() {
            return Err(invalid("shape.bands", "at least one band is required"));
        }
        let mut seen = HashSet::new();
        for band in &shape.bands {
            if !seen.insert(band.as_str()) {
                return Err(invalid("shape.bands", format!("band '{band}' is listed twice")));
            }
        }

        let split = &self.split;
        for (field, fraction) in [
            ("split.validation", split.validation),
            ("split.testing", split.testing),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(invalid(field, "must be within [0, 1]"));
            }
        }
        if split.validation + split.testing > 1.0 {
            return Err(invalid("split", "validation + testing must not exceed 1"));
        }

        let mut names = HashSet::new();
        for dataset in &self.datasets {
            if dataset.name.trim().is_empty() {
                return Err(invalid("datasets.name", "must not be empty"));
            }
            if !names.insert(dataset.name.as_str()) {
                return Err(invalid(
                    "datasets.name",
                    format!("dataset '{}' is declared twice", dataset.name),
                ));
            }
        }

        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(self.resolve(&self.data_directory))
    }
}

fn check_path_component(field: &'static str, value: &str) -> Result<(), SettingsError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    if value == "." || value == ".." || value.contains(&['/', '\\'][..]) {
        return Err(invalid(field, format!("'{value}' is not a valid directory name")));
    }
    Ok(())
}

/// Paths under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(ObjectStore::CACHE_PREFIX)
    }

    pub fn feature_store_dir(&self, version: &str) -> PathBuf {
        self.root.join(ObjectStore::FEATURES_PREFIX).join(version)
    }

    pub fn manifest_path(&self, version: &str) -> PathBuf {
        self.root.join(ObjectStore::manifest_key(version))
    }

    pub fn features_path(&self, version: &str) -> PathBuf {
        self.root.join(ObjectStore::features_key(version))
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join(ObjectStore::HISTORY_KEY)
    }

    pub fn open_store(&self) -> Result<ObjectStore, StoreError> {
        ObjectStore::open(&self.root)
    }
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_retry_count() -> u32 {
    3
}

fn default_batch_size() -> usize {
    50
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_coordinate_precision() -> u32 {
    4
}

fn default_bands() -> Vec<String> {
    ["B2", "B3", "B4", "B8"].iter().map(|band| band.to_string()).collect()
}

fn default_timesteps() -> usize {
    12
}

fn default_min_valid_timesteps() -> usize {
    6
}

fn default_max_gap_fill() -> usize {
    1
}

fn default_failure_review_threshold() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        project_name = "kenya-maize"
        data_directory = "data"
        feature_store_version = "v1"
        provider_version = "s2-l2a-2024"
        date_range = { start = "2021-01-01", end = "2022-01-01" }
    "#;

    #[test]
    fn defaults_are_pinned() {
        let settings = Settings::from_toml_str(MINIMAL).unwrap();
        assert_eq!(settings.concurrency_limit, 4);
        assert_eq!(settings.retry_count, 3);
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.retry.base_delay_ms, 500);
        assert_eq!(settings.retry.max_delay_ms, 30_000);
        assert_eq!(settings.dedup.coordinate_precision, 4);
        assert_eq!(settings.shape.bands, vec!["B2", "B3", "B4", "B8"]);
        assert_eq!(settings.shape.timesteps, 12);
        assert_eq!(settings.shape.min_valid_timesteps, 6);
        assert_eq!(settings.shape.max_gap_fill, 1);
        assert!(!settings.cache.retry_partial);
        assert_eq!(settings.failure_review_threshold, 3);
        assert_eq!(settings.run_timeout_secs, None);
        assert!(settings.datasets.is_empty());
    }

    #[test]
    fn parses_dataset_declarations() {
        let contents = format!(
            "{MINIMAL}\n{}",
            r#"
            [[datasets]]
            name = "survey"
            path = "sources/survey_*.csv"
            label_map = { "1" = "maize", "0" = "non_crop" }

            [[datasets]]
            name = "inference"
            path = "sources/grid.geojson"
            format = "geo_json"
            unlabeled = true
            default_date = "2021-06-01"
            "#
        );
        let settings = Settings::from_toml_str(&contents).unwrap();
        assert_eq!(settings.datasets.len(), 2);
        assert_eq!(settings.datasets[0].label_map["1"], "maize");
        assert!(settings.datasets[1].unlabeled);
        assert_eq!(
            settings.datasets[1].format,
            Some(mapflow_parser::SourceFormat::GeoJson)
        );
    }

    #[test]
    fn rejects_inverted_date_range() {
        let contents = MINIMAL.replace("2022-01-01", "2020-01-01");
        let err = Settings::from_toml_str(&contents).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "date_range", .. }));
    }

    #[test]
    fn rejects_zero_concurrency_and_bad_splits() {
        let contents = format!("{MINIMAL}\nconcurrency_limit = 0\n");
        let err = Settings::from_toml_str(&contents).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Invalid {
                field: "concurrency_limit",
                ..
            }
        ));

        let contents = format!("{MINIMAL}\nsplit = {{ validation = 0.6, testing = 0.6 }}\n");
        let err = Settings::from_toml_str(&contents).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "split", .. }));
    }

    #[test]
    fn rejects_min_valid_above_timesteps() {
        let contents = format!("{MINIMAL}\nshape = {{ timesteps = 4, min_valid_timesteps = 5 }}\n");
        let err = Settings::from_toml_str(&contents).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Invalid {
                field: "shape.min_valid_timesteps",
                ..
            }
        ));
    }

    #[test]
    fn load_resolves_data_directory_against_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapflow.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let settings = Settings::load(&path).unwrap();
        let layout = settings.layout();
        assert_eq!(layout.root(), dir.path().join("data"));
        assert_eq!(
            layout.manifest_path("v1"),
            dir.path().join("data/features/v1/manifest.json")
        );
        assert_eq!(
            layout.history_path(),
            dir.path().join("data/fetch_history.json")
        );
    }
}
