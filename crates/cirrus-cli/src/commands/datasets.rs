//! `cirrus datasets` — inspect the dataset catalog.

use anyhow::Context as _;
use cirrus_core::{
  config::Config,
  dataset::{FacetFilter, SourceType},
  store::EvaluationStore as _,
};
use cirrus_store_sqlite::SqliteStore;
use clap::{Args, Subcommand};

#[derive(Subcommand)]
pub enum DatasetsCommand {
  /// List active datasets as a deduplicated column projection.
  List(ListArgs),
}

#[derive(Args)]
pub struct ListArgs {
  /// Restrict to one source type.
  #[arg(long)]
  source_type: Option<String>,

  /// Columns to project, comma-separated.
  #[arg(
    long,
    value_delimiter = ',',
    default_value = "instance_id,version,variable_id,source_id"
  )]
  columns: Vec<String>,

  /// Facet filters of the form `facet=value`; repeatable, conjunctive.
  #[arg(long = "filter", value_name = "FACET=VALUE")]
  filters: Vec<String>,

  /// Maximum rows to print.
  #[arg(long, default_value_t = 100)]
  limit: usize,
}

pub async fn run(
  config: &Config,
  command: DatasetsCommand,
) -> anyhow::Result<()> {
  let DatasetsCommand::List(args) = command;

  let store = SqliteStore::from_config(&config.db)
    .await
    .context("opening the datastore")?;

  let source_types: Vec<SourceType> = match &args.source_type {
    Some(name) => vec![
      SourceType::parse(name)
        .with_context(|| format!("unknown source type {name:?}"))?,
    ],
    None => SourceType::ordered().to_vec(),
  };

  let filters = args
    .filters
    .iter()
    .map(|raw| {
      let (facet, value) = raw.split_once('=').with_context(|| {
        format!("filter {raw:?} is not of the form facet=value")
      })?;
      Ok(FacetFilter::keep(facet, value))
    })
    .collect::<anyhow::Result<Vec<_>>>()?;

  println!("{}", args.columns.join("\t"));
  let mut remaining = args.limit;
  for source_type in source_types {
    if remaining == 0 {
      break;
    }
    let catalog = store
      .load_catalog(source_type)
      .await
      .context("loading the catalog")?
      .filter(&filters);
    for row in catalog.project(&args.columns, remaining) {
      println!("{}", row.join("\t"));
      remaining -= 1;
    }
  }
  Ok(())
}
