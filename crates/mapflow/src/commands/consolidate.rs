use anyhow::Result;
use clap::Args;
use comfy_table::Table;
use mapflow_core::registry::DatasetRegistry;
use mapflow_core::summary::DatasetSummary;
use mapflow_core::validation::consolidate;
use mapflow_core::Settings;

use super::print_registration;

#[derive(Args, Debug, Default)]
pub struct ConsolidateArgs {
    /// Exit with an error when any row is rejected
    #[arg(long)]
    strict: bool,
}

pub fn handle_consolidate(settings: &Settings, args: ConsolidateArgs) -> Result<()> {
    let mut registry = DatasetRegistry::new(settings);
    let registration = registry.register_all(&settings.datasets);
    print_registration(&registration);

    let consolidation = consolidate(registry.datasets(), settings);
    let summary = DatasetSummary::from_dataset(&consolidation.dataset, &settings.split);

    println!(
        "Consolidated {} input point(s) into {} ({} duplicate(s) collapsed, {} labeled)",
        consolidation.input_points,
        summary.points,
        consolidation.duplicates_collapsed,
        summary.labeled()
    );
    println!("Snapshot hash: {}", summary.snapshot_hash);

    let mut labels = Table::new();
    labels.set_header(vec!["Label", "Points"]);
    for (label, count) in &summary.by_label {
        labels.add_row(vec![label.clone(), count.to_string()]);
    }
    println!("{labels}");

    let mut subsets = Table::new();
    subsets.set_header(vec!["Subset", "Points"]);
    for (subset, count) in &summary.by_subset {
        subsets.add_row(vec![subset.to_string(), count.to_string()]);
    }
    println!("{subsets}");

    if !consolidation.violations.is_empty() {
        let mut violations = Table::new();
        violations.set_header(vec!["Dataset", "Row", "Kind", "Message"]);
        for violation in &consolidation.violations {
            violations.add_row(vec![
                violation.dataset.clone(),
                violation.row.to_string(),
                format!("{:?}", violation.kind),
                violation.message.clone(),
            ]);
        }
        println!("{violations}");
    }

    if args.strict {
        consolidation.into_strict()?;
    }
    Ok(())
}
