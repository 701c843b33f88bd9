use crate::errors::{ReaderAttempt, ReaderError};
use crate::formats::{GeoJsonReader, TabularReader};
use crate::model::{ParsedSource, ReadOptions, SourceFormat};

pub trait PointReader: Send + Sync {
    fn name(&self) -> &'static str;
    fn format(&self) -> SourceFormat;
    fn read(&self, content: &str, options: &ReadOptions) -> Result<ParsedSource, ReaderError>;
}

static GEOJSON_READER: GeoJsonReader = GeoJsonReader;
static CSV_READER: TabularReader = TabularReader::csv();
static TSV_READER: TabularReader = TabularReader::tsv();

/// Readers in detection order. GeoJSON goes first because it rejects
/// non-JSON content cheaply.
pub fn all_readers() -> [&'static dyn PointReader; 3] {
    [&GEOJSON_READER, &CSV_READER, &TSV_READER]
}

pub fn reader_for(format: SourceFormat) -> &'static dyn PointReader {
    match format {
        SourceFormat::Csv => &CSV_READER,
        SourceFormat::Tsv => &TSV_READER,
        SourceFormat::GeoJson => &GEOJSON_READER,
    }
}

/// Reads with the reader for `format`, or detects the format when it is unknown.
pub fn read_source(
    content: &str,
    format: Option<SourceFormat>,
    options: &ReadOptions,
) -> Result<ParsedSource, ReaderError> {
    match format {
        Some(format) => reader_for(format).read(content, options),
        None => read_with_readers(content, &all_readers(), options),
    }
}

pub fn read_with_readers(
    content: &str,
    readers: &[&dyn PointReader],
    options: &ReadOptions,
) -> Result<ParsedSource, ReaderError> {
    let mut attempts = Vec::new();

    for reader in readers {
        match reader.read(content, options) {
            Ok(parsed) => return Ok(parsed),
            Err(ReaderError::FormatMismatch { reason, .. }) => {
                attempts.push(ReaderAttempt::new(reader.name(), reason));
            }
            Err(err) => return Err(err),
        }
    }

    Err(ReaderError::NoMatchingReader { attempts })
}
