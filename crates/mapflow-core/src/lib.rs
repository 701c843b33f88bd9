pub mod assembler;
pub mod cache;
pub mod error;
pub mod fetch;
pub mod history;
pub mod manifest;
pub mod object_gc;
pub mod object_store;
pub mod outputs;
pub mod readers;
pub mod registry;
pub mod settings;
pub mod shape;
pub mod split;
pub mod summary;
pub mod types;
pub mod validation;

pub use assembler::{
    create_features, create_features_from_settings, BuildOutcome, PipelineRun, RunControl,
};
pub use error::{CacheError, PipelineError, Result};
pub use settings::{DataLayout, Settings};
