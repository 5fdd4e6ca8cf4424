//! `cirrus solve` — solve for required executions and dispatch them.

use std::time::Duration;

use anyhow::{Context as _, bail};
use cirrus_core::config::Config;
use cirrus_executor::recovery::{fail_lost_executions, local_worker_alive};
use cirrus_solver::{SolveOptions, solve_required_executions};
use cirrus_store_sqlite::SqliteStore;
use clap::Args;
use tracing::info;

use crate::registry::{build_executor, build_registry, job_for};

#[derive(Args)]
pub struct SolveArgs {
  /// Only solve diagnostics whose provider slug contains this value.
  #[arg(long)]
  provider: Option<String>,

  /// Only solve diagnostics whose slug contains this value.
  #[arg(long)]
  diagnostic: Option<String>,

  /// Wall-clock budget in seconds for the whole solve-and-execute pass;
  /// pending executions are cancelled when it runs out.
  #[arg(long, default_value_t = 3600)]
  timeout: u64,

  /// Enqueue at most one new execution per provider.
  #[arg(long)]
  one_per_provider: bool,

  /// Resolve and report candidates without creating or running anything.
  #[arg(long)]
  dry_run: bool,
}

pub async fn run(config: &Config, args: SolveArgs) -> anyhow::Result<()> {
  let store = SqliteStore::from_config(&config.db)
    .await
    .context("opening the datastore")?;
  let registry = build_registry(config)?;

  // Resume cleanly: running executions whose worker died are failed so
  // they can be retried.
  let lost = fail_lost_executions(&store, local_worker_alive)
    .await
    .context("lost-worker recovery failed")?;
  if !lost.is_empty() {
    info!(count = lost.len(), "failed executions left by lost workers");
  }

  let outcome = solve_required_executions(&store, &registry, &SolveOptions {
    provider_filter: args.provider.clone(),
    diagnostic_filter: args.diagnostic.clone(),
    dry_run: args.dry_run,
    one_per_provider: args.one_per_provider,
    scratch_root: config.paths.scratch.clone(),
  })
  .await
  .context("solving failed")?;

  println!(
    "{} candidates, {} new groups, {} executions enqueued, {} groups \
     flagged stale",
    outcome.summary.candidates,
    outcome.summary.groups_created,
    outcome.summary.executions_created,
    outcome.summary.groups_flagged_stale,
  );

  if args.dry_run || outcome.planned.is_empty() {
    return Ok(());
  }

  let executor = build_executor(config, store)?;
  for planned in outcome.planned {
    executor.submit(job_for(&registry, planned)?).await?;
  }

  let summary = executor.join(Duration::from_secs(args.timeout)).await?;
  println!(
    "{} succeeded, {} failed, {} cancelled{}",
    summary.succeeded,
    summary.failed,
    summary.cancelled,
    if summary.timed_out { " (timed out)" } else { "" },
  );

  if !summary.all_succeeded() {
    bail!("one or more executions failed or were cancelled");
  }
  Ok(())
}
