use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::Table;
use mapflow_core::{create_features_from_settings, BuildOutcome, RunControl, Settings};
use tracing::warn;

use super::print_registration;
use crate::provider::HttpProvider;

const FAILURES_SHOWN: usize = 20;

#[derive(Args, Debug, Default)]
pub struct CreateFeaturesArgs {
    /// Stop issuing new fetches after this many seconds (overrides run_timeout_secs)
    #[arg(long)]
    timeout_secs: Option<u64>,
}

pub async fn handle_create_features(settings: &Settings, args: CreateFeaturesArgs) -> Result<()> {
    let provider = HttpProvider::from_env().context("failed to configure imagery provider")?;

    let control = Arc::new(match args.timeout_secs.or(settings.run_timeout_secs) {
        Some(secs) => RunControl::with_timeout(Duration::from_secs(secs)),
        None => RunControl::new(),
    });
    let interrupt = {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; in-flight batches will finish");
                control.cancel();
            }
        })
    };

    println!(
        "Building feature store '{}' for project '{}' ({})",
        settings.feature_store_version, settings.project_name, settings.date_range
    );
    let run = create_features_from_settings(settings, &provider, &control).await;
    interrupt.abort();
    let run = run.context("feature build failed")?;

    print_registration(&run.registration);
    print_outcome(&run.build);
    Ok(())
}

fn print_outcome(outcome: &BuildOutcome) {
    let manifest = &outcome.manifest;
    let counts = &manifest.counts;

    let mut table = Table::new();
    table.set_header(vec!["Outcome", "Points"]);
    table.add_row(vec!["succeeded".to_string(), counts.succeeded.to_string()]);
    table.add_row(vec!["partial".to_string(), counts.partial.to_string()]);
    table.add_row(vec!["failed".to_string(), counts.failed.to_string()]);
    table.add_row(vec!["excluded".to_string(), counts.excluded.to_string()]);
    table.add_row(vec!["total".to_string(), manifest.point_count.to_string()]);
    println!("{table}");

    println!(
        "Build mode: {}; cache hits: {}; points fetched: {}; duplicates collapsed: {}",
        outcome.build_mode, outcome.cache_hits, outcome.fetches_issued, outcome.duplicates_collapsed
    );
    if !outcome.violations.is_empty() {
        println!(
            "{} row(s) rejected during consolidation; run `mapflow consolidate` for details.",
            outcome.violations.len()
        );
    }

    if !manifest.failures.is_empty() {
        let mut failures = Table::new();
        failures.set_header(vec!["Point", "Status", "Reason"]);
        for failure in manifest.failures.iter().take(FAILURES_SHOWN) {
            failures.add_row(vec![
                failure.point_id.to_string(),
                failure.status.to_string(),
                failure.reason.clone(),
            ]);
        }
        println!("{failures}");
        if manifest.failures.len() > FAILURES_SHOWN {
            println!("  ... and {} more", manifest.failures.len() - FAILURES_SHOWN);
        }
    }

    if !manifest.review_flagged.is_empty() {
        println!(
            "{} point(s) are flagged for manual review; see `mapflow-admin review list`.",
            manifest.review_flagged.len()
        );
    }
    if outcome.cancelled {
        println!("Run was cancelled; unfetched points were excluded and will be fetched next run.");
    }
}
