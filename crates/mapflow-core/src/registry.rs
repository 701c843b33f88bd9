use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use mapflow_parser::{
    read_source, ColumnOverrides, ReadOptions, ReaderAttempt, ReaderError, SourceFormat,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::settings::Settings;
use crate::types::{content_hash, LabeledDataset, LabeledPoint, PointId, Provenance};

/// Declaration of one labeled source, as written under `[[datasets]]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// File path or glob pattern; relative paths resolve against the settings file.
    pub path: PathBuf,
    #[serde(default)]
    pub format: Option<SourceFormat>,
    #[serde(default)]
    pub columns: ColumnOverrides,
    #[serde(default)]
    pub label_map: BTreeMap<String, String>,
    #[serde(default)]
    pub unlabeled: bool,
    #[serde(default)]
    pub default_date: Option<NaiveDate>,
    #[serde(default)]
    pub date_format: Option<String>,
    /// Points in different namespaces never share ids. Sources without a
    /// namespace share the default one, so identical coordinates collide.
    #[serde(default)]
    pub id_namespace: Option<String>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            columns: self.columns.clone(),
            unlabeled: self.unlabeled,
            default_date: self.default_date,
            date_format: self.date_format.clone(),
            label_map: self.label_map.clone(),
        }
    }

    /// Explicit format, else by extension; `None` means detect from content.
    pub fn format_for(&self, path: &Path) -> Option<SourceFormat> {
        self.format.or_else(|| {
            path.extension()
                .and_then(|extension| extension.to_str())
                .and_then(SourceFormat::from_extension)
        })
    }

    fn namespace(&self) -> &str {
        self.id_namespace.as_deref().unwrap_or("")
    }

    /// Digest of every field that shapes the derived points, plus the id
    /// precision. Name and path are left out.
    pub fn config_hash(&self, precision: u32) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct ReadConfig<'a> {
            format: Option<SourceFormat>,
            columns: &'a ColumnOverrides,
            label_map: &'a BTreeMap<String, String>,
            unlabeled: bool,
            default_date: Option<NaiveDate>,
            date_format: Option<&'a str>,
            id_namespace: &'a str,
            precision: u32,
        }

        let bytes = serde_json::to_vec(&ReadConfig {
            format: self.format,
            columns: &self.columns,
            label_map: &self.label_map,
            unlabeled: self.unlabeled,
            default_date: self.default_date,
            date_format: self.date_format.as_deref(),
            id_namespace: self.namespace(),
            precision,
        })?;
        Ok(content_hash(&bytes))
    }
}

/// Maps one source's bytes to an immutable snapshot.
pub fn register(
    source: &SourceConfig,
    dataset_name: &str,
    path: &Path,
    contents: &[u8],
    precision: u32,
) -> Result<LabeledDataset, PipelineError> {
    let schema_error = |error: ReaderError| PipelineError::Schema {
        dataset: dataset_name.to_string(),
        error,
    };

    let text = std::str::from_utf8(contents).map_err(|err| {
        schema_error(ReaderError::NoMatchingReader {
            attempts: vec![ReaderAttempt::new("utf8", err.to_string())],
        })
    })?;

    let parsed =
        read_source(text, source.format_for(path), &source.read_options()).map_err(schema_error)?;

    let points = parsed
        .rows
        .into_iter()
        .map(|row| LabeledPoint {
            id: PointId::derive(row.latitude, row.longitude, source.namespace(), precision),
            latitude: row.latitude,
            longitude: row.longitude,
            observation_date: row.observation_date,
            label: row.label,
            source_dataset: dataset_name.to_string(),
            row: row.row,
        })
        .collect();

    let provenance = Provenance::Source {
        path: path.to_path_buf(),
        format: parsed.format,
        reader: parsed.reader.to_string(),
        content_hash: content_hash(contents),
        config_hash: source.config_hash(precision)?,
        ingested_at: Utc::now(),
    };

    Ok(LabeledDataset::new(
        dataset_name,
        points,
        provenance,
        parsed.issues,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Registered,
    /// Same name, identical bytes and reading configuration as the snapshot already held.
    Unchanged,
    /// Same name, new content or configuration; the previous snapshot was replaced.
    Replaced,
}

#[derive(Debug, Clone)]
pub struct SourceReport {
    pub dataset: String,
    pub path: PathBuf,
    pub status: SourceStatus,
    pub points: usize,
    pub row_issues: usize,
}

#[derive(Debug)]
pub struct SourceFailure {
    pub dataset: String,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct RegistrationReport {
    pub sources: Vec<SourceReport>,
    pub failures: Vec<SourceFailure>,
}

impl RegistrationReport {
    pub fn registered(&self) -> usize {
        self.sources
            .iter()
            .filter(|source| source.status != SourceStatus::Unchanged)
            .count()
    }
}

/// Snapshots in registration order. Later snapshots win deduplication.
#[derive(Debug)]
pub struct DatasetRegistry {
    precision: u32,
    base_dir: PathBuf,
    datasets: Vec<LabeledDataset>,
}

impl DatasetRegistry {
    pub fn new(settings: &Settings) -> Self {
        Self {
            precision: settings.dedup.coordinate_precision,
            base_dir: settings.base_dir().to_path_buf(),
            datasets: Vec::new(),
        }
    }

    pub fn datasets(&self) -> &[LabeledDataset] {
        &self.datasets
    }

    pub fn get(&self, name: &str) -> Option<&LabeledDataset> {
        self.datasets.iter().find(|dataset| dataset.name() == name)
    }

    pub fn into_datasets(self) -> Vec<LabeledDataset> {
        self.datasets
    }

    pub fn register_bytes(
        &mut self,
        source: &SourceConfig,
        dataset_name: &str,
        path: &Path,
        contents: &[u8],
    ) -> Result<SourceReport, PipelineError> {
        let hash = content_hash(contents);
        let config = source.config_hash(self.precision)?;
        let position = self
            .datasets
            .iter()
            .position(|dataset| dataset.name() == dataset_name);

        if let Some(existing) = position.map(|index| &self.datasets[index]) {
            let unchanged = matches!(
                existing.provenance(),
                Provenance::Source {
                    content_hash: previous_content,
                    config_hash: previous_config,
                    ..
                } if *previous_content == hash && *previous_config == config
            );
            if unchanged {
                debug!(dataset = dataset_name, "source unchanged; keeping snapshot");
                return Ok(SourceReport {
                    dataset: dataset_name.to_string(),
                    path: path.to_path_buf(),
                    status: SourceStatus::Unchanged,
                    points: existing.len(),
                    row_issues: existing.row_issues().len(),
                });
            }
        }

        let dataset = register(source, dataset_name, path, contents, self.precision)?;
        let mut report = SourceReport {
            dataset: dataset_name.to_string(),
            path: path.to_path_buf(),
            status: SourceStatus::Registered,
            points: dataset.len(),
            row_issues: dataset.row_issues().len(),
        };

        match position {
            Some(index) => {
                self.datasets[index] = dataset;
                report.status = SourceStatus::Replaced;
            }
            None => self.datasets.push(dataset),
        }

        info!(
            dataset = dataset_name,
            points = report.points,
            row_issues = report.row_issues,
            "registered source"
        );
        Ok(report)
    }

    /// Reads every file the declaration matches. Glob matches are registered
    /// in path order as `<name>:<file name>`.
    pub fn register(&mut self, source: &SourceConfig) -> Result<Vec<SourceReport>, PipelineError> {
        let paths = self.expand(source)?;
        let many = paths.len() > 1;

        let mut reports = Vec::with_capacity(paths.len());
        for path in paths {
            let dataset_name = if many {
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("{}:{file_name}", source.name)
            } else {
                source.name.clone()
            };

            let contents = std::fs::read(&path).map_err(|error| PipelineError::SourceRead {
                dataset: dataset_name.clone(),
                path: path.clone(),
                error,
            })?;
            reports.push(self.register_bytes(source, &dataset_name, &path, &contents)?);
        }
        Ok(reports)
    }

    /// Registers in declaration order. A failing source is reported and the rest continue.
    pub fn register_all(&mut self, sources: &[SourceConfig]) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        for source in sources {
            match self.register(source) {
                Ok(reports) => report.sources.extend(reports),
                Err(error) => {
                    warn!(dataset = %source.name, error = %error, "source registration failed");
                    report.failures.push(SourceFailure {
                        dataset: source.name.clone(),
                        error,
                    });
                }
            }
        }
        report
    }

    fn expand(&self, source: &SourceConfig) -> Result<Vec<PathBuf>, PipelineError> {
        let resolved = if source.path.is_absolute() {
            source.path.clone()
        } else {
            self.base_dir.join(&source.path)
        };
        let pattern = resolved.to_string_lossy().into_owned();
        if !pattern.contains(&['*', '?', '['][..]) {
            return Ok(vec![resolved]);
        }

        let read_error = |error: io::Error| PipelineError::SourceRead {
            dataset: source.name.clone(),
            path: resolved.clone(),
            error,
        };

        let entries = glob::glob(&pattern)
            .map_err(|err| read_error(io::Error::new(io::ErrorKind::InvalidInput, err.to_string())))?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry.map_err(|err| read_error(err.into_error()))?);
        }
        paths.sort();

        if paths.is_empty() {
            return Err(read_error(io::Error::new(
                io::ErrorKind::NotFound,
                "pattern matched no files",
            )));
        }
        Ok(paths)
    }
}
