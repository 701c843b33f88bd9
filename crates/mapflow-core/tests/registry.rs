mod common;

use std::collections::BTreeMap;

use common::{fixture_path, test_settings};
use mapflow_core::error::PipelineError;
use mapflow_core::registry::{DatasetRegistry, SourceConfig, SourceStatus};
use mapflow_core::types::{Label, Provenance};
use mapflow_parser::{ReaderError, SourceFormat};

#[test]
fn registers_declared_sources_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let mut survey = SourceConfig::new("survey", fixture_path("fields_a.csv"));
    survey.label_map = BTreeMap::from([
        ("1".to_string(), "maize".to_string()),
        ("0".to_string(), "non_crop".to_string()),
    ]);
    let parcels = SourceConfig::new("parcels", fixture_path("fields_b.geojson"));

    let mut registry = DatasetRegistry::new(&settings);
    let report = registry.register_all(&[survey, parcels]);

    assert!(report.failures.is_empty());
    assert_eq!(report.registered(), 2);

    let names: Vec<&str> = registry.datasets().iter().map(|d| d.name()).collect();
    assert_eq!(names, vec!["survey", "parcels"]);

    let survey = registry.get("survey").unwrap();
    assert_eq!(survey.len(), 4);
    assert_eq!(survey.points()[2].label, Label::Class("maize".to_string()));
    assert_eq!(survey.points()[3].label, Label::Class("non_crop".to_string()));
    // Identical rows produce identical ids; deduplication happens later.
    assert_eq!(survey.points()[0].id, survey.points()[1].id);

    let parcels = registry.get("parcels").unwrap();
    assert_eq!(parcels.len(), 2);
    assert_eq!(parcels.row_issues().len(), 1);
    match parcels.provenance() {
        Provenance::Source { format, reader, .. } => {
            assert_eq!(*format, SourceFormat::GeoJson);
            assert_eq!(reader, "vector_geojson");
        }
        other => panic!("unexpected provenance {other:?}"),
    }
}

#[test]
fn schema_failure_is_reported_and_others_continue() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let broken = SourceConfig::new("broken", fixture_path("missing_date.csv"));
    let good = SourceConfig::new("good", fixture_path("fields_a.csv"));
    let missing = SourceConfig::new("missing", dir.path().join("nope.csv"));

    let mut registry = DatasetRegistry::new(&settings);
    let report = registry.register_all(&[broken, good, missing]);

    assert_eq!(registry.datasets().len(), 1);
    assert_eq!(registry.datasets()[0].name(), "good");
    assert_eq!(report.failures.len(), 2);

    match &report.failures[0].error {
        PipelineError::Schema { dataset, error } => {
            assert_eq!(dataset, "broken");
            assert!(matches!(
                error,
                ReaderError::MissingField { field: "date", .. }
            ));
        }
        other => panic!("expected a schema error, got {other:?}"),
    }
    assert!(matches!(
        report.failures[1].error,
        PipelineError::SourceRead { .. }
    ));
}

#[test]
fn default_date_unblocks_a_dateless_source() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let mut source = SourceConfig::new("dateless", fixture_path("missing_date.csv"));
    source.default_date = Some(common::date(2021, 2, 1));

    let mut registry = DatasetRegistry::new(&settings);
    let reports = registry.register(&source).unwrap();
    assert_eq!(reports[0].points, 1);
    assert_eq!(
        registry.datasets()[0].points()[0].observation_date,
        common::date(2021, 2, 1)
    );
}

#[test]
fn reregistering_identical_bytes_keeps_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let source = SourceConfig::new("survey", "survey.csv");
    let path = std::path::Path::new("survey.csv");

    let mut registry = DatasetRegistry::new(&settings);
    let first = registry
        .register_bytes(&source, "survey", path, b"lat,lon,date,label\n1,2,2021-01-01,maize\n")
        .unwrap();
    let hash = registry.datasets()[0].snapshot_hash().to_string();

    let again = registry
        .register_bytes(&source, "survey", path, b"lat,lon,date,label\n1,2,2021-01-01,maize\n")
        .unwrap();
    let changed = registry
        .register_bytes(&source, "survey", path, b"lat,lon,date,label\n1,2,2021-01-01,rice\n")
        .unwrap();

    assert_eq!(first.status, SourceStatus::Registered);
    assert_eq!(again.status, SourceStatus::Unchanged);
    assert_eq!(changed.status, SourceStatus::Replaced);
    assert_eq!(registry.datasets().len(), 1);
    assert_ne!(registry.datasets()[0].snapshot_hash(), hash);
}

#[test]
fn reregistering_identical_bytes_with_new_config_rebuilds_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let contents = b"lat,lon,date,label\n1.0,2.0,2021-01-05,1\n";
    let path = std::path::Path::new("survey.csv");
    let plain = SourceConfig::new("survey", "survey.csv");
    let mut mapped = plain.clone();
    mapped.label_map = BTreeMap::from([("1".to_string(), "maize".to_string())]);
    let mut namespaced = mapped.clone();
    namespaced.id_namespace = Some("east".to_string());

    let mut registry = DatasetRegistry::new(&settings);
    registry.register_bytes(&plain, "survey", path, contents).unwrap();
    let original_id = registry.datasets()[0].points()[0].id.clone();
    assert_eq!(
        registry.datasets()[0].points()[0].label,
        Label::Class("1".to_string())
    );

    let relabeled = registry
        .register_bytes(&mapped, "survey", path, contents)
        .unwrap();
    assert_eq!(relabeled.status, SourceStatus::Replaced);
    assert_eq!(
        registry.datasets()[0].points()[0].label,
        Label::Class("maize".to_string())
    );

    let same = registry
        .register_bytes(&mapped, "survey", path, contents)
        .unwrap();
    assert_eq!(same.status, SourceStatus::Unchanged);

    let moved = registry
        .register_bytes(&namespaced, "survey", path, contents)
        .unwrap();
    assert_eq!(moved.status, SourceStatus::Replaced);
    assert_ne!(registry.datasets()[0].points()[0].id, original_id);
    assert_eq!(registry.datasets().len(), 1);
}

#[test]
fn snapshot_hash_ignores_ingestion_time_and_path() {
    let contents = b"lat,lon,date,label\n1,2,2021-01-01,maize\n";
    let source = SourceConfig::new("survey", "a.csv");

    let first = mapflow_core::registry::register(&source, "survey", "a.csv".as_ref(), contents, 4)
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = mapflow_core::registry::register(&source, "survey", "b.csv".as_ref(), contents, 4)
        .unwrap();

    assert_eq!(first.snapshot_hash(), second.snapshot_hash());
}

#[test]
fn glob_sources_register_each_file_in_path_order() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let sources = dir.path().join("sources");
    std::fs::create_dir_all(&sources).unwrap();
    std::fs::write(
        sources.join("b.csv"),
        "lat,lon,date,label\n3,4,2021-01-01,rice\n",
    )
    .unwrap();
    std::fs::write(
        sources.join("a.csv"),
        "lat,lon,date,label\n1,2,2021-01-01,maize\n",
    )
    .unwrap();

    let source = SourceConfig::new("survey", sources.join("*.csv"));
    let mut registry = DatasetRegistry::new(&settings);
    let reports = registry.register(&source).unwrap();

    let names: Vec<&str> = reports.iter().map(|r| r.dataset.as_str()).collect();
    assert_eq!(names, vec!["survey:a.csv", "survey:b.csv"]);

    let empty = SourceConfig::new("empty", sources.join("*.geojson"));
    assert!(matches!(
        registry.register(&empty),
        Err(PipelineError::SourceRead { .. })
    ));
}

#[test]
fn namespaces_keep_identical_coordinates_apart() {
    let contents = b"lat,lon,date,label\n1,2,2021-01-01,maize\n";

    let shared = SourceConfig::new("a", "a.csv");
    let mut separate = SourceConfig::new("b", "b.csv");
    separate.id_namespace = Some("hold-out".to_string());

    let a = mapflow_core::registry::register(&shared, "a", "a.csv".as_ref(), contents, 4).unwrap();
    let b =
        mapflow_core::registry::register(&separate, "b", "b.csv".as_ref(), contents, 4).unwrap();
    assert_ne!(a.points()[0].id, b.points()[0].id);
}
