// crates/mapflow-core/src/error.rs

use std::path::PathBuf;

use mapflow_parser::ReaderError;
use thiserror::Error;

use crate::object_store::StoreError;
use crate::settings::SettingsError;
use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Source '{dataset}' has an unusable schema: {error}")]
    Schema {
        dataset: String,
        #[source]
        error: ReaderError,
    },

    #[error("Failed to read source '{dataset}' at {}: {error}", path.display())]
    SourceRead {
        dataset: String,
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Imagery provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars operation failed: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Feature store error: {0}")]
    FeatureStore(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to write cache entry {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to read cache entry {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("cache entry {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PipelineError {
    /// Errors that end the whole run rather than a single source or point.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::Schema { .. }
                | PipelineError::SourceRead { .. }
                | PipelineError::Validation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
