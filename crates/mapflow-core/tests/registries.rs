use mapflow_core::readers::all_reader_descriptors;
use mapflow_parser::SourceFormat;

#[test]
fn registries_are_populated() {
    assert!(
        all_reader_descriptors()
            .iter()
            .any(|reader| reader.code == "tabular_csv" && reader.format == SourceFormat::Csv),
        "expected the CSV reader to be registered"
    );

    assert!(
        all_reader_descriptors()
            .iter()
            .any(|reader| reader.code == "vector_geojson"),
        "expected the GeoJSON reader to be registered"
    );
}
