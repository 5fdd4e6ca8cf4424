//! `cirrus executions` — inspect and manage the execution lifecycle.

use anyhow::{Context as _, bail};
use cirrus_core::{
  config::Config,
  diagnostic::PlannedExecution,
  store::{EvaluationStore as _, ExecutionStatus, GroupFilter},
};
use cirrus_executor::{ExecutorPaths, run_job};
use cirrus_store_sqlite::SqliteStore;
use clap::{Args, Subcommand};

use crate::registry::{build_registry, job_for};

#[derive(Subcommand)]
pub enum ExecutionsCommand {
  /// List execution groups with their latest execution.
  ListGroups(ListGroupsArgs),
  /// Show one execution in detail: inputs, outputs, status history.
  Inspect(InspectArgs),
  /// Re-queue a failed execution.
  Retry(RetryArgs),
  /// Run a planned execution in-process (used by batch job scripts).
  Run(RunArgs),
}

#[derive(Args)]
pub struct ListGroupsArgs {
  /// Substring filter on the provider slug (case-sensitive).
  #[arg(long)]
  provider: Option<String>,

  /// Substring filter on the diagnostic slug (case-sensitive).
  #[arg(long)]
  diagnostic: Option<String>,

  /// Only dirty (or, with `--dirty false`, only clean) groups.
  #[arg(long)]
  dirty: Option<bool>,

  /// Filter on whether the latest execution succeeded.
  #[arg(long)]
  successful: Option<bool>,
}

#[derive(Args)]
pub struct InspectArgs {
  execution_id: i64,
}

#[derive(Args)]
pub struct RetryArgs {
  execution_id: i64,
}

#[derive(Args)]
pub struct RunArgs {
  /// Path to a serialized planned execution.
  #[arg(long)]
  planned: std::path::PathBuf,
}

pub async fn run(
  config: &Config,
  command: ExecutionsCommand,
) -> anyhow::Result<()> {
  let store = SqliteStore::from_config(&config.db)
    .await
    .context("opening the datastore")?;

  match command {
    ExecutionsCommand::ListGroups(args) => {
      let groups = store
        .list_groups(&GroupFilter {
          provider:   args.provider,
          diagnostic: args.diagnostic,
          dirty:      args.dirty,
          successful: args.successful,
        })
        .await
        .context("listing execution groups")?;

      println!("id\tprovider\tdiagnostic\tgroup_key\tdirty\tstale\tlatest");
      for entry in groups {
        let latest = entry
          .latest
          .map(|e| format!("{} ({})", e.id, e.status))
          .unwrap_or_else(|| "-".to_string());
        println!(
          "{}\t{}\t{}\t{}\t{}\t{}\t{}",
          entry.group.id,
          entry.provider_slug,
          entry.diagnostic_slug,
          entry.group.group_key,
          entry.group.dirty,
          entry.group.stale,
          latest,
        );
      }
      Ok(())
    }

    ExecutionsCommand::Inspect(args) => {
      let Some(execution) = store
        .get_execution(args.execution_id)
        .await
        .context("loading the execution")?
      else {
        bail!("no execution with id {}", args.execution_id);
      };

      println!("execution {}", execution.id);
      println!("  status:       {}", execution.status);
      if let Some(reason) = &execution.reason {
        println!("  reason:       {reason}");
      }
      println!("  dataset hash: {}", execution.dataset_hash);
      println!("  results dir:  {}", execution.output_fragment);
      println!("  retries:      {}", execution.retry_count);
      if let Some(started) = execution.started_at {
        println!("  started:      {started}");
      }
      if let Some(finished) = execution.finished_at {
        println!("  finished:     {finished}");
      }

      let inputs = store
        .execution_inputs(execution.id)
        .await
        .context("loading execution inputs")?;
      println!("  inputs:");
      for (source_type, dataset) in inputs {
        println!(
          "    {source_type}\t{}\t{}",
          dataset.instance_id, dataset.version
        );
      }

      let outputs = store
        .list_outputs(execution.id)
        .await
        .context("loading execution outputs")?;
      if !outputs.is_empty() {
        println!("  outputs:");
        for output in outputs {
          println!(
            "    {}\t{}\t{}",
            output.output_type.as_str(),
            output.short_name,
            output.filename
          );
        }
      }
      Ok(())
    }

    ExecutionsCommand::Retry(args) => {
      let retried = store
        .transition_execution(
          args.execution_id,
          ExecutionStatus::Failed,
          ExecutionStatus::Pending,
          None,
          None,
        )
        .await
        .context("retrying the execution")?;
      if !retried {
        bail!(
          "execution {} is not in the failed state",
          args.execution_id
        );
      }
      println!("execution {} re-queued", args.execution_id);
      Ok(())
    }

    ExecutionsCommand::Run(args) => {
      let raw = std::fs::read(&args.planned).with_context(|| {
        format!("reading planned execution {:?}", args.planned)
      })?;
      let planned: PlannedExecution = serde_json::from_slice(&raw)
        .context("decoding the planned execution")?;

      let registry = build_registry(config)?;
      let job = job_for(&registry, planned)?;
      let paths = ExecutorPaths::new(
        &config.paths.scratch,
        &config.paths.results,
      );
      let worker = format!("batch:{}:run", std::process::id());

      let status = run_job(&store, &paths, &job, &worker)
        .await
        .context("running the execution")?;
      println!("execution finished: {status}");
      if status != ExecutionStatus::Succeeded {
        bail!("execution ended in state {status}");
      }
      Ok(())
    }
  }
}
