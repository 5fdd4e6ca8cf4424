//! `cirrus` — command-line interface for the Cirrus evaluation engine.
//!
//! Reads its configuration from a discovered directory (see `config.rs`),
//! opens the SQLite store, and exposes the core operations: ingest
//! datasets, solve for required executions, and inspect the execution
//! lifecycle.

mod commands;
mod config;
mod registry;

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cirrus", version, about = "Climate-model evaluation engine")]
struct Cli {
  /// Configuration directory; defaults to CIRRUS_CONFIGURATION, then the
  /// user config location.
  #[arg(long, global = true, value_name = "DIR")]
  config_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Ingest dataset files into the catalog.
  Ingest(commands::ingest::IngestArgs),
  /// Inspect the dataset catalog.
  #[command(subcommand)]
  Datasets(commands::datasets::DatasetsCommand),
  /// Solve for executions that require calculation and run them.
  Solve(commands::solve::SolveArgs),
  /// Inspect and manage execution groups and executions.
  #[command(subcommand)]
  Executions(commands::executions::ExecutionsCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  let config_dir = config::discover_config_dir(cli.config_dir.clone());
  let config = config::load_config(&config_dir)
    .with_context(|| format!("loading configuration from {config_dir:?}"))?;

  // Initialise tracing with the configured level; RUST_LOG still wins.
  let default_level: LevelFilter = config
    .log_level
    .as_directive()
    .parse()
    .unwrap_or(LevelFilter::INFO);
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy(),
    )
    .init();

  match cli.command {
    Command::Ingest(args) => commands::ingest::run(&config, args).await,
    Command::Datasets(command) => {
      commands::datasets::run(&config, command).await
    }
    Command::Solve(args) => commands::solve::run(&config, args).await,
    Command::Executions(command) => {
      commands::executions::run(&config, command).await
    }
  }
}
