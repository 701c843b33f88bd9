use std::collections::BTreeMap;
use std::io::Cursor;

use polars::df;
use polars::io::parquet::write::{ParquetCompression, ParquetWriter, StatisticsOptions};
use polars::prelude::*;

use crate::error::PipelineError;
use crate::fetch::FetchStatus;
use crate::manifest::{EntryStatus, FeatureStoreManifest};
use crate::object_store::ObjectStore;
use crate::settings::DataLayout;
use crate::shape::{FeatureVector, TimestepQuality};
use crate::types::{Label, PointId};

/// Long format: one row per (point, band, timestep). Missing values are null.
pub fn features_dataframe(vectors: &[FeatureVector]) -> PolarsResult<DataFrame> {
    let rows: usize = vectors
        .iter()
        .map(|vector| vector.bands.len() * vector.timesteps)
        .sum();

    let mut point_ids = Vec::with_capacity(rows);
    let mut labels: Vec<Option<String>> = Vec::with_capacity(rows);
    let mut subsets = Vec::with_capacity(rows);
    let mut bands = Vec::with_capacity(rows);
    let mut timesteps = Vec::with_capacity(rows);
    let mut values: Vec<Option<f64>> = Vec::with_capacity(rows);
    let mut qualities = Vec::with_capacity(rows);

    for vector in vectors {
        for (b, band) in vector.bands.iter().enumerate() {
            for t in 0..vector.timesteps {
                let value = vector.value(b, t);
                point_ids.push(vector.point_id.to_string());
                labels.push(vector.label.class_name().map(str::to_string));
                subsets.push(vector.subset.as_str().to_string());
                bands.push(band.clone());
                timesteps.push(t as i64);
                values.push((!value.is_nan()).then_some(value));
                qualities.push(vector.quality[t].as_str().to_string());
            }
        }
    }

    df!(
        "point_id" => point_ids,
        "label" => labels,
        "subset" => subsets,
        "band" => bands,
        "timestep" => timesteps,
        "value" => values,
        "quality" => qualities,
    )
}

pub fn create_parquet_bytes(dataframe: &mut DataFrame) -> PolarsResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    ParquetWriter::new(&mut cursor)
        .with_compression(ParquetCompression::Zstd(None))
        .with_statistics(StatisticsOptions::default())
        .finish(dataframe)?;
    Ok(cursor.into_inner())
}

/// Writes `features.parquet` for `version`, vectors ordered by point id.
pub fn write_features(
    store: &ObjectStore,
    version: &str,
    vectors: &[FeatureVector],
) -> Result<(), PipelineError> {
    let mut ordered: Vec<&FeatureVector> = vectors.iter().collect();
    ordered.sort_by(|a, b| a.point_id.cmp(&b.point_id));
    let ordered: Vec<FeatureVector> = ordered.into_iter().cloned().collect();

    let mut dataframe = features_dataframe(&ordered)?;
    let bytes = create_parquet_bytes(&mut dataframe)?;
    store.put_replace(&ObjectStore::features_key(version), &bytes)?;
    Ok(())
}

/// A built feature store loaded back from disk.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    pub manifest: FeatureStoreManifest,
    pub vectors: BTreeMap<PointId, FeatureVector>,
}

impl FeatureStore {
    pub fn open(layout: &DataLayout, version: &str) -> Result<Self, PipelineError> {
        let store = layout.open_store()?;
        let manifest = FeatureStoreManifest::load(&store, version)?.ok_or_else(|| {
            PipelineError::FeatureStore(format!("no manifest for feature store '{version}'"))
        })?;
        let bytes = store
            .get(&ObjectStore::features_key(version))?
            .ok_or_else(|| {
                PipelineError::FeatureStore(format!("no features for feature store '{version}'"))
            })?;
        let dataframe = ParquetReader::new(Cursor::new(bytes)).finish()?;
        let vectors = vectors_from_dataframe(&dataframe, &manifest)?;
        Ok(Self { manifest, vectors })
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

fn vectors_from_dataframe(
    dataframe: &DataFrame,
    manifest: &FeatureStoreManifest,
) -> Result<BTreeMap<PointId, FeatureVector>, PipelineError> {
    let point_ids = dataframe.column("point_id")?.str()?;
    let labels = dataframe.column("label")?.str()?;
    let bands = dataframe.column("band")?.str()?;
    let timesteps = dataframe.column("timestep")?.i64()?;
    let values = dataframe.column("value")?.f64()?;
    let qualities = dataframe.column("quality")?.str()?;

    let shape = &manifest.shape;
    let t_len = shape.timesteps;
    let mut vectors: BTreeMap<PointId, FeatureVector> = BTreeMap::new();

    for idx in 0..dataframe.height() {
        let malformed = |what: &str| PipelineError::FeatureStore(format!("row {idx}: {what}"));

        let point_id = PointId::from(point_ids.get(idx).ok_or_else(|| malformed("null point_id"))?);
        let band = bands.get(idx).ok_or_else(|| malformed("null band"))?;
        let b = shape
            .bands
            .iter()
            .position(|known| known == band)
            .ok_or_else(|| malformed("band not in manifest shape"))?;
        let t = timesteps
            .get(idx)
            .and_then(|t| usize::try_from(t).ok())
            .filter(|t| *t < t_len)
            .ok_or_else(|| malformed("timestep outside manifest shape"))?;
        let quality = qualities
            .get(idx)
            .and_then(TimestepQuality::parse)
            .ok_or_else(|| malformed("unknown quality"))?;

        if !vectors.contains_key(&point_id) {
            let entry = manifest
                .entries
                .get(&point_id)
                .ok_or_else(|| malformed("point missing from manifest"))?;
            let label = match labels.get(idx) {
                Some(name) => Label::Class(name.to_string()),
                None => Label::Unlabeled,
            };
            let status = match entry.status {
                EntryStatus::Partial => FetchStatus::Partial,
                _ => FetchStatus::Complete,
            };
            vectors.insert(
                point_id.clone(),
                FeatureVector {
                    point_id: point_id.clone(),
                    label,
                    subset: entry.subset,
                    cache_key: entry.cache_key.clone(),
                    status,
                    bands: shape.bands.clone(),
                    timesteps: t_len,
                    values: vec![f64::NAN; shape.bands.len() * t_len],
                    quality: vec![TimestepQuality::Missing; t_len],
                },
            );
        }

        if let Some(vector) = vectors.get_mut(&point_id) {
            vector.values[b * t_len + t] = values.get(idx).unwrap_or(f64::NAN);
            vector.quality[t] = quality;
        }
    }

    Ok(vectors)
}
