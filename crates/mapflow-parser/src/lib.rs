pub mod errors;
pub mod formats;
pub mod model;
mod registry;

pub use errors::{ReaderAttempt, ReaderError};
pub use model::{
    ColumnOverrides, ParsedSource, PointLabel, ReadOptions, RowIssue, SourceFormat, SourceRow,
};
pub use registry::{all_readers, read_source, read_with_readers, reader_for, PointReader};
