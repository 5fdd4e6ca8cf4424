//! Static resolution of configured providers and executors.
//!
//! Providers and executor variants are referenced by fully-qualified name
//! in the configuration and resolved here against a compile-time table; no
//! code is loaded at runtime.

use std::sync::Arc;

use anyhow::{Context as _, bail};
use cirrus_core::{
  config::Config,
  provider::{DiagnosticProvider, ProviderRegistry},
};
use cirrus_executor::{
  ExecutionJob, Executor as _, ExecutorPaths, JoinSummary,
  hpc::{HpcExecutor, HpcOptions, PbsScheduler, SlurmScheduler},
  local::LocalPoolExecutor,
  queue::QueueExecutor,
  synchronous::SynchronousExecutor,
};
use cirrus_store_sqlite::SqliteStore;

/// Build the provider registry from configuration.
pub fn build_registry(config: &Config) -> anyhow::Result<ProviderRegistry> {
  let mut providers: Vec<DiagnosticProvider> = Vec::new();
  for entry in &config.diagnostic_providers {
    let provider = match entry.provider.as_str() {
      "cirrus_core.example" | "example" => cirrus_core::example::example_provider(),
      other => bail!("unknown diagnostic provider {other:?}"),
    };
    providers.push(provider);
  }
  Ok(ProviderRegistry::new(providers))
}

/// The configured executor variant; dispatch is a tagged enum because the
/// variants are generic over scheduler types.
pub enum AnyExecutor {
  Synchronous(SynchronousExecutor<SqliteStore>),
  LocalPool(LocalPoolExecutor<SqliteStore>),
  Queue(QueueExecutor<SqliteStore>),
  HpcSlurm(HpcExecutor<SqliteStore, SlurmScheduler>),
  HpcPbs(HpcExecutor<SqliteStore, PbsScheduler>),
}

impl AnyExecutor {
  pub async fn submit(&self, job: ExecutionJob) -> anyhow::Result<()> {
    match self {
      AnyExecutor::Synchronous(e) => e.submit(job).await?,
      AnyExecutor::LocalPool(e) => e.submit(job).await?,
      AnyExecutor::Queue(e) => e.submit(job).await?,
      AnyExecutor::HpcSlurm(e) => e.submit(job).await?,
      AnyExecutor::HpcPbs(e) => e.submit(job).await?,
    };
    Ok(())
  }

  pub async fn join(
    &self,
    timeout: std::time::Duration,
  ) -> anyhow::Result<JoinSummary> {
    let summary = match self {
      AnyExecutor::Synchronous(e) => e.join(timeout).await?,
      AnyExecutor::LocalPool(e) => e.join(timeout).await?,
      AnyExecutor::Queue(e) => e.join(timeout).await?,
      AnyExecutor::HpcSlurm(e) => e.join(timeout).await?,
      AnyExecutor::HpcPbs(e) => e.join(timeout).await?,
    };
    Ok(summary)
  }
}

/// Build the configured executor over `store`.
pub fn build_executor(
  config: &Config,
  store: SqliteStore,
) -> anyhow::Result<AnyExecutor> {
  let paths = ExecutorPaths::new(
    &config.paths.scratch,
    &config.paths.results,
  );
  let options = &config.executor.config;

  Ok(match config.executor.executor.as_str() {
    "cirrus_executor.SynchronousExecutor" | "synchronous" => {
      AnyExecutor::Synchronous(SynchronousExecutor::new(store, paths))
    }
    "cirrus_executor.LocalPoolExecutor" | "local-pool" => {
      let pool_size = options
        .get("pool_size")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
      AnyExecutor::LocalPool(LocalPoolExecutor::new(store, paths, pool_size))
    }
    "cirrus_executor.QueueExecutor" | "distributed-queue" => {
      AnyExecutor::Queue(QueueExecutor::new(store))
    }
    "cirrus_executor.HpcExecutor" | "hpc-batch" => {
      let hpc_options = HpcOptions {
        queue:      options
          .get("queue")
          .and_then(|v| v.as_str())
          .map(str::to_string),
        walltime:   options
          .get("walltime")
          .and_then(|v| v.as_str())
          .map(str::to_string),
        cirrus_bin: options
          .get("cirrus_bin")
          .and_then(|v| v.as_str())
          .map(Into::into)
          .or_else(|| std::env::current_exe().ok())
          .context("cannot determine the cirrus binary path")?,
        extra:      options
          .get("extra_directives")
          .and_then(|v| v.as_array())
          .map(|lines| {
            lines
              .iter()
              .filter_map(|l| l.as_str().map(str::to_string))
              .collect()
          })
          .unwrap_or_default(),
      };
      let scheduler = options
        .get("scheduler")
        .and_then(|v| v.as_str())
        .unwrap_or("slurm");
      match scheduler {
        "slurm" => AnyExecutor::HpcSlurm(HpcExecutor::new(
          store,
          SlurmScheduler,
          hpc_options,
        )),
        "pbs" => AnyExecutor::HpcPbs(HpcExecutor::new(
          store,
          PbsScheduler,
          hpc_options,
        )),
        other => bail!("unknown HPC scheduler {other:?}"),
      }
    }
    other => bail!("unknown executor {other:?}"),
  })
}

/// Look up a planned execution's diagnostic in the registry and pair them
/// into a job.
pub fn job_for(
  registry: &ProviderRegistry,
  planned: cirrus_core::diagnostic::PlannedExecution,
) -> anyhow::Result<ExecutionJob> {
  let diagnostic: Arc<dyn cirrus_core::diagnostic::Diagnostic> = registry
    .lookup(&planned.provider_slug, &planned.diagnostic_slug)
    .with_context(|| {
      format!(
        "no registered diagnostic {}/{}",
        planned.provider_slug, planned.diagnostic_slug
      )
    })?;
  Ok(ExecutionJob { planned, diagnostic })
}
