use mapflow_parser::SourceFormat;
use once_cell::sync::Lazy;

#[derive(Debug, Clone)]
pub struct ReaderDescriptor {
    pub code: &'static str,
    pub format: SourceFormat,
    pub extensions: &'static [&'static str],
    pub description: &'static str,
}

static READERS: Lazy<Vec<ReaderDescriptor>> = Lazy::new(|| {
    vec![
        ReaderDescriptor {
            code: "vector_geojson",
            format: SourceFormat::GeoJson,
            extensions: &["geojson", "json"],
            description: "GeoJSON features; polygons reduced to exterior-ring centroids",
        },
        ReaderDescriptor {
            code: "tabular_csv",
            format: SourceFormat::Csv,
            extensions: &["csv"],
            description: "Comma-separated rows with coordinate, date and label columns",
        },
        ReaderDescriptor {
            code: "tabular_tsv",
            format: SourceFormat::Tsv,
            extensions: &["tsv", "tab"],
            description: "Tab-separated rows with coordinate, date and label columns",
        },
    ]
});

pub fn all_reader_descriptors() -> &'static [ReaderDescriptor] {
    READERS.as_slice()
}

pub fn descriptor_for(code: &str) -> Option<&'static ReaderDescriptor> {
    READERS.iter().find(|descriptor| descriptor.code == code)
}
