//! `cirrus ingest` — walk paths and populate the dataset catalog.

use anyhow::{Context as _, bail};
use cirrus_core::{config::Config, dataset::SourceType};
use cirrus_ingest::{IngestOptions, cmip6::Cmip6Parser};
use cirrus_store_sqlite::SqliteStore;
use clap::Args;

#[derive(Args)]
pub struct IngestArgs {
  /// Source type of the datasets: cmip6, obs4mips, pmp-climatology.
  #[arg(long)]
  source_type: String,

  /// Files, directories, or glob patterns to ingest (absolute paths).
  #[arg(required = true)]
  paths: Vec<String>,

  /// Abort on the first file that fails to parse instead of skipping it.
  #[arg(long)]
  strict: bool,

  /// Worker threads for metadata extraction (0 = all cores).
  #[arg(long, default_value_t = 0)]
  n_jobs: usize,

  /// CMIP6 parser: `drs` (path-based) or `complete` (opens each file).
  #[arg(long, default_value = "drs")]
  parser: String,
}

pub async fn run(config: &Config, args: IngestArgs) -> anyhow::Result<()> {
  let source_type = SourceType::parse(&args.source_type)
    .with_context(|| format!("unknown source type {:?}", args.source_type))?;
  let Some(parser) = Cmip6Parser::parse(&args.parser) else {
    bail!("unknown parser {:?}; expected 'drs' or 'complete'", args.parser);
  };

  let store = SqliteStore::from_config(&config.db)
    .await
    .context("opening the datastore")?;

  let summary = cirrus_ingest::ingest(
    &store,
    source_type,
    &args.paths,
    &IngestOptions {
      skip_invalid: !args.strict,
      n_jobs: args.n_jobs,
      parser,
    },
  )
  .await
  .context("ingest failed")?;

  println!(
    "{} files found, {} parsed, {} skipped; {} datasets created, {} already \
     known",
    summary.files_found,
    summary.files_parsed,
    summary.files_skipped,
    summary.datasets_created,
    summary.datasets_existing,
  );
  Ok(())
}
