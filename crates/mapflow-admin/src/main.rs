use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::Table;
use mapflow_core::history::FetchHistory;
use mapflow_core::object_gc;
use mapflow_core::object_store::ObjectStore;
use mapflow_core::types::PointId;
use mapflow_core::Settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Mapflow administrative tooling", long_about = None)]
struct Cli {
    /// Settings file; falls back to MAPFLOW_SETTINGS, then ./mapflow.toml
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan (and optionally apply) removal of cache entries no manifest references
    CacheGc(CacheGcArgs),
    /// Inspect or clear points flagged for manual review
    Review {
        #[command(subcommand)]
        command: ReviewCommand,
    },
}

#[derive(Args, Debug, Default)]
struct CacheGcArgs {
    /// Apply deletions instead of running in dry-run mode
    #[arg(long)]
    apply: bool,
}

#[derive(Subcommand, Debug)]
enum ReviewCommand {
    /// List every point with a failure record
    List {
        /// Only show points flagged for review
        #[arg(long)]
        flagged: bool,
    },
    /// Drop a point's record so the next run fetches it again
    Clear {
        point_id: String,
        /// Only clear the record for this provider version
        #[arg(long)]
        provider_version: Option<String>,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let path = cli
        .settings
        .or_else(|| env::var_os("MAPFLOW_SETTINGS").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("mapflow.toml"));
    let settings = Settings::load(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    let store = settings
        .layout()
        .open_store()
        .context("failed to open data directory")?;

    match cli.command {
        Command::CacheGc(args) => handle_cache_gc(&store, args),
        Command::Review { command } => handle_review(&store, command),
    }
}

fn handle_cache_gc(store: &ObjectStore, args: CacheGcArgs) -> Result<()> {
    let report = object_gc::plan_gc(store)?;
    info!(
        manifests = report.manifests.len(),
        orphaned = report.total_orphaned(),
        "planned cache gc"
    );

    if report.total_orphaned() == 0 {
        println!(
            "No orphaned cache entries found across {} manifest(s).",
            report.manifests.len()
        );
    } else {
        println!("Found {} orphaned objects:", report.total_orphaned());
        for entry in &report.entries {
            if entry.orphaned.is_empty() {
                continue;
            }
            println!("  Prefix '{}': {} keys", entry.prefix, entry.orphaned.len());
            for key in &entry.orphaned {
                println!("    {}", key);
            }
        }
    }

    if args.apply {
        object_gc::apply_gc(store, &report)?;
        println!("Applied cache garbage collection successfully.");
    } else if report.total_orphaned() > 0 {
        println!("Run again with --apply to delete the orphaned objects.");
    }

    Ok(())
}

fn handle_review(store: &ObjectStore, command: ReviewCommand) -> Result<()> {
    let mut history = FetchHistory::load(store).context("failed to load fetch history")?;

    match command {
        ReviewCommand::List { flagged } => {
            let mut table = Table::new();
            table.set_header(vec![
                "Point",
                "Provider version",
                "Failures",
                "State",
                "Last error",
            ]);
            let mut shown = 0;
            for record in history.records() {
                if flagged && !record.flagged_for_review {
                    continue;
                }
                let state = if record.rejected {
                    "rejected"
                } else if record.flagged_for_review {
                    "review"
                } else {
                    "retrying"
                };
                table.add_row(vec![
                    record.point_id.to_string(),
                    record.provider_version.clone(),
                    record.consecutive_failures.to_string(),
                    state.to_string(),
                    record.last_error.clone().unwrap_or_default(),
                ]);
                shown += 1;
            }
            if shown == 0 {
                println!("No matching fetch history records.");
            } else {
                println!("{table}");
            }
        }
        ReviewCommand::Clear {
            point_id,
            provider_version,
        } => {
            let point_id = PointId::from(point_id.as_str());
            let cleared = match provider_version {
                Some(version) => usize::from(history.clear(&point_id, &version).is_some()),
                None => history.clear_point(&point_id),
            };
            if cleared == 0 {
                println!("No fetch history recorded for point {point_id}.");
                return Ok(());
            }
            history.save(store).context("failed to save fetch history")?;
            info!(point_id = %point_id, cleared, "cleared fetch history");
            println!("Cleared {cleared} record(s) for point {point_id}; it will be fetched on the next run.");
        }
    }

    Ok(())
}
