use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::Table;
use mapflow_core::outputs::FeatureStore;
use mapflow_core::shape::TimestepQuality;
use mapflow_core::Settings;

#[derive(Args, Debug, Default)]
pub struct InspectArgs {
    /// Feature store version; defaults to feature_store_version from settings
    store_version: Option<String>,
}

pub fn handle_inspect(settings: &Settings, args: InspectArgs) -> Result<()> {
    let version = args
        .store_version
        .unwrap_or_else(|| settings.feature_store_version.clone());
    let store = FeatureStore::open(&settings.layout(), &version)
        .with_context(|| format!("failed to open feature store '{version}'"))?;
    let manifest = &store.manifest;

    println!(
        "Feature store '{}' of project '{}', built {}",
        manifest.version, manifest.project_name, manifest.created_at
    );
    println!(
        "Provider version {}, range {}, shape {} band(s) x {} timestep(s)",
        manifest.provider_version,
        manifest.date_range,
        manifest.shape.bands.len(),
        manifest.shape.timesteps
    );

    let mut datasets = Table::new();
    datasets.set_header(vec!["Order", "Dataset", "Snapshot hash"]);
    for (position, snapshot) in manifest.dataset_snapshots.iter().enumerate() {
        datasets.add_row(vec![
            (position + 1).to_string(),
            snapshot.name.clone(),
            snapshot.hash.clone(),
        ]);
    }
    println!("{datasets}");

    let mut by_subset: BTreeMap<String, usize> = BTreeMap::new();
    let mut quality: BTreeMap<&'static str, usize> = BTreeMap::new();
    for vector in store.vectors.values() {
        *by_subset.entry(vector.subset.to_string()).or_default() += 1;
        for mark in [
            TimestepQuality::Observed,
            TimestepQuality::Filled,
            TimestepQuality::Missing,
        ] {
            *quality.entry(mark.as_str()).or_default() += vector.count(mark);
        }
    }

    let mut table = Table::new();
    table.set_header(vec!["Subset", "Vectors"]);
    for (subset, count) in &by_subset {
        table.add_row(vec![subset.clone(), count.to_string()]);
    }
    println!("{table}");

    let mut table = Table::new();
    table.set_header(vec!["Timestep quality", "Slots"]);
    for (mark, count) in &quality {
        table.add_row(vec![mark.to_string(), count.to_string()]);
    }
    println!("{table}");

    let counts = &manifest.counts;
    println!(
        "{} point(s): {} succeeded, {} partial, {} failed, {} excluded; {} flagged for review",
        manifest.point_count,
        counts.succeeded,
        counts.partial,
        counts.failed,
        counts.excluded,
        manifest.review_flagged.len()
    );
    Ok(())
}
