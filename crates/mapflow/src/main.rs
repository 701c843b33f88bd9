use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mapflow_core::Settings;
use tracing_subscriber::EnvFilter;

mod commands;
mod provider;

use commands::consolidate::{handle_consolidate, ConsolidateArgs};
use commands::features::{handle_create_features, CreateFeaturesArgs};
use commands::inspect::{handle_inspect, InspectArgs};

const DEFAULT_SETTINGS: &str = "mapflow.toml";

/// Builds versioned satellite feature stores from labeled points.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file; falls back to MAPFLOW_SETTINGS, then ./mapflow.toml
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register datasets, fetch imagery and write the feature store
    CreateFeatures(CreateFeaturesArgs),
    /// Register and consolidate the declared datasets without fetching
    Consolidate(ConsolidateArgs),
    /// Summarize a built feature store
    Inspect(InspectArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.settings)?;

    match cli.command {
        Command::CreateFeatures(args) => handle_create_features(&settings, args).await,
        Command::Consolidate(args) => handle_consolidate(&settings, args),
        Command::Inspect(args) => handle_inspect(&settings, args),
    }
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    let path = path
        .or_else(|| env::var_os("MAPFLOW_SETTINGS").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS));
    Settings::load(&path).with_context(|| format!("failed to load settings from {}", path.display()))
}
