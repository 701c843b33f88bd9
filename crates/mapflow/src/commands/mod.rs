pub mod consolidate;
pub mod features;
pub mod inspect;

use comfy_table::Table;
use mapflow_core::registry::{RegistrationReport, SourceStatus};

/// Prints the per-source outcome of a registration pass.
pub fn print_registration(report: &RegistrationReport) {
    let mut table = Table::new();
    table.set_header(vec!["Dataset", "Status", "Points", "Row issues"]);
    for source in &report.sources {
        let status = match source.status {
            SourceStatus::Registered => "registered",
            SourceStatus::Unchanged => "unchanged",
            SourceStatus::Replaced => "replaced",
        };
        table.add_row(vec![
            source.dataset.clone(),
            status.to_string(),
            source.points.to_string(),
            source.row_issues.to_string(),
        ]);
    }
    for failure in &report.failures {
        table.add_row(vec![
            failure.dataset.clone(),
            "failed".to_string(),
            "-".to_string(),
            "-".to_string(),
        ]);
    }
    println!("{table}");

    for failure in &report.failures {
        eprintln!("WARNING: skipped dataset '{}': {}", failure.dataset, failure.error);
    }
}
