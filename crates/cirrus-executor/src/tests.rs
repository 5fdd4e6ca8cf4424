//! Executor integration tests against an in-memory store and a temporary
//! scratch/results tree.

use std::{
  collections::BTreeMap,
  future::Future,
  path::{Path, PathBuf},
  sync::{Arc, Mutex as StdMutex},
  time::Duration,
};

use cirrus_core::{
  dataset::{
    CatalogEntry, DatasetCollection, ExecutionDatasets, GroupKey, SourceType,
  },
  diagnostic::{
    Diagnostic, ExecutionDefinition, ExecutionResult, PlannedExecution,
  },
  example::FileCountDiagnostic,
  provider::{DiagnosticProvider, ProviderRegistry},
  requirement::DataRequirement,
  store::{
    EvaluationStore, ExecutionStatus, NewExecution,
  },
};
use cirrus_store_sqlite::SqliteStore;

use crate::{
  ExecutionJob, Executor, ExecutorPaths, hpc, local::LocalPoolExecutor,
  queue::{QueueExecutor, QueueWorker},
  recovery::{LOST_WORKER_REASON, fail_lost_executions, local_worker_alive},
  synchronous::SynchronousExecutor,
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

struct Harness {
  store:   SqliteStore,
  scratch: tempfile::TempDir,
  results: tempfile::TempDir,
}

impl Harness {
  async fn new() -> Harness {
    Harness {
      store:   SqliteStore::open_in_memory().await.unwrap(),
      scratch: tempfile::tempdir().unwrap(),
      results: tempfile::tempdir().unwrap(),
    }
  }

  fn paths(&self) -> ExecutorPaths {
    ExecutorPaths::new(self.scratch.path(), self.results.path())
  }

  /// Create provider/diagnostic/group/execution rows and return a job
  /// running `diagnostic`.
  async fn plan(
    &self,
    diagnostic: Arc<dyn Diagnostic>,
    key_value: &str,
  ) -> ExecutionJob {
    let provider =
      self.store.register_provider("example", "1.0.0").await.unwrap();
    let diagnostic_row = self
      .store
      .register_diagnostic(provider.id, diagnostic.slug())
      .await
      .unwrap();

    let key = GroupKey::new(vec![(
      "variable_id".to_string(),
      key_value.to_string(),
    )]);
    let (group, _) =
      self.store.ensure_group(diagnostic_row.id, &key).await.unwrap();

    let entry = CatalogEntry {
      dataset_id:  1,
      instance_id: format!("CMIP6.test.{key_value}"),
      version:     "v1".to_string(),
      path:        PathBuf::from(format!("/data/{key_value}.nc")),
      time_range:  None,
      facets:      BTreeMap::from([(
        "variable_id".to_string(),
        key_value.to_string(),
      )]),
    };
    let datasets = ExecutionDatasets::new(BTreeMap::from([(
      SourceType::Cmip6,
      DatasetCollection { selector: key.clone(), entries: vec![entry] },
    )]));

    let execution = self
      .store
      .create_execution(NewExecution {
        group_id:        group.id,
        dataset_hash:    datasets.hash(),
        fragment_prefix: format!(
          "example/{}/{}",
          diagnostic.slug(),
          key.slug()
        ),
        inputs:          datasets.dataset_refs(),
      })
      .await
      .unwrap();

    ExecutionJob {
      planned: PlannedExecution {
        execution_id:    execution.id,
        group_id:        group.id,
        provider_slug:   "example".to_string(),
        diagnostic_slug: diagnostic.slug().to_string(),
        definition:      ExecutionDefinition {
          key,
          datasets,
          output_directory: self
            .scratch
            .path()
            .join(&execution.output_fragment),
          root_directory: self.scratch.path().to_path_buf(),
        },
      },
      diagnostic,
    }
  }
}

struct FailingDiagnostic {
  requirements: Vec<DataRequirement>,
  facets:       Vec<String>,
}

impl FailingDiagnostic {
  fn new() -> FailingDiagnostic {
    FailingDiagnostic {
      requirements: vec![DataRequirement::new(SourceType::Cmip6)],
      facets:       Vec::new(),
    }
  }
}

impl Diagnostic for FailingDiagnostic {
  fn slug(&self) -> &str {
    "always-fails"
  }

  fn data_requirements(&self) -> &[DataRequirement] {
    &self.requirements
  }

  fn facets(&self) -> &[String] {
    &self.facets
  }

  fn execute(
    &self,
    _definition: &ExecutionDefinition,
  ) -> cirrus_core::Result<()> {
    Err(cirrus_core::Error::ExecutionFailed(
      "synthetic diagnostic failure".to_string(),
    ))
  }

  fn build_execution_result(
    &self,
    _definition: &ExecutionDefinition,
  ) -> cirrus_core::Result<ExecutionResult> {
    Ok(ExecutionResult::from_failure())
  }
}

/// Writes a metric bundle whose deepest level holds objects instead of
/// scalars.
struct BadBundleDiagnostic {
  requirements: Vec<DataRequirement>,
  facets:       Vec<String>,
}

impl BadBundleDiagnostic {
  fn new() -> BadBundleDiagnostic {
    BadBundleDiagnostic {
      requirements: vec![DataRequirement::new(SourceType::Cmip6)],
      facets:       vec![
        "region".to_string(),
        "metric".to_string(),
        "statistic".to_string(),
      ],
    }
  }
}

impl Diagnostic for BadBundleDiagnostic {
  fn slug(&self) -> &str {
    "bad-bundle"
  }

  fn data_requirements(&self) -> &[DataRequirement] {
    &self.requirements
  }

  fn facets(&self) -> &[String] {
    &self.facets
  }

  fn execute(
    &self,
    definition: &ExecutionDefinition,
  ) -> cirrus_core::Result<()> {
    std::fs::create_dir_all(&definition.output_directory)?;
    Ok(())
  }

  fn build_execution_result(
    &self,
    definition: &ExecutionDefinition,
  ) -> cirrus_core::Result<ExecutionResult> {
    // Leaves must be scalars; these carry stray objects.
    let bundle = serde_json::json!({
      "DIMENSIONS": {
        "json_structure": ["region", "metric", "statistic"],
        "region": {"global": {}},
        "metric": {"bias": {}},
        "statistic": {"mean": {}},
      },
      "RESULTS": {
        "global": {"bias": {"mean": {"value": 0.5, "units": "K"}}},
      },
    });
    std::fs::write(
      definition.output_path("diagnostic.json"),
      serde_json::to_vec(&bundle)?,
    )?;
    cirrus_core::cmec::OutputBundle::default()
      .write(&definition.output_path("output.json"))?;

    Ok(ExecutionResult {
      successful:             true,
      output_bundle_filename: Some(PathBuf::from("output.json")),
      metric_bundle_filename: Some(PathBuf::from("diagnostic.json")),
      series:                 Vec::new(),
    })
  }
}

/// Sleeps long enough that a short join deadline always fires first.
struct SleepyDiagnostic {
  requirements: Vec<DataRequirement>,
  facets:       Vec<String>,
}

impl SleepyDiagnostic {
  fn new() -> SleepyDiagnostic {
    SleepyDiagnostic {
      requirements: vec![DataRequirement::new(SourceType::Cmip6)],
      facets:       Vec::new(),
    }
  }
}

impl Diagnostic for SleepyDiagnostic {
  fn slug(&self) -> &str {
    "sleepy"
  }

  fn data_requirements(&self) -> &[DataRequirement] {
    &self.requirements
  }

  fn facets(&self) -> &[String] {
    &self.facets
  }

  fn execute(
    &self,
    _definition: &ExecutionDefinition,
  ) -> cirrus_core::Result<()> {
    std::thread::sleep(Duration::from_secs(2));
    Ok(())
  }

  fn build_execution_result(
    &self,
    _definition: &ExecutionDefinition,
  ) -> cirrus_core::Result<ExecutionResult> {
    Ok(ExecutionResult::from_failure())
  }
}

// ─── Synchronous executor ────────────────────────────────────────────────────

#[tokio::test]
async fn synchronous_executor_runs_to_success() {
  let h = Harness::new().await;
  let job =
    h.plan(Arc::new(FileCountDiagnostic::new("tas")), "tas").await;
  let execution_id = job.planned.execution_id;
  let fragment = job.planned.definition.output_fragment().unwrap();

  let executor = SynchronousExecutor::new(h.store.clone(), h.paths());
  executor.submit(job).await.unwrap();

  let summary = executor.join(Duration::from_secs(1)).await.unwrap();
  assert_eq!(summary.succeeded, 1);
  assert!(summary.all_succeeded());

  let row = h.store.get_execution(execution_id).await.unwrap().unwrap();
  assert_eq!(row.status, ExecutionStatus::Succeeded);
  assert!(row.finished_at.is_some());

  // Outputs recorded with relative paths; joining them onto the results
  // root reproduces the copied files.
  let outputs = h.store.list_outputs(execution_id).await.unwrap();
  assert_eq!(outputs.len(), 1);
  assert_eq!(outputs[0].filename, "data/inputs.csv");
  assert!(!Path::new(&outputs[0].filename).is_absolute());
  assert!(
    h.results.path().join(&fragment).join(&outputs[0].filename).exists()
  );
  assert!(h.results.path().join(&fragment).join("diagnostic.json").exists());
  assert!(h.results.path().join(&fragment).join("output.json").exists());
  assert!(h.results.path().join(&fragment).join("out.log").exists());

  // Scratch is removed on success.
  assert!(!h.scratch.path().join(&fragment).exists());

  // A successful execution makes its group clean.
  let groups = h
    .store
    .list_groups(&cirrus_core::store::GroupFilter::default())
    .await
    .unwrap();
  assert!(!groups[0].group.dirty);
}

#[tokio::test]
async fn failing_diagnostic_does_not_stop_the_batch() {
  let h = Harness::new().await;
  let failing = h.plan(Arc::new(FailingDiagnostic::new()), "pr").await;
  let failing_id = failing.planned.execution_id;
  let good =
    h.plan(Arc::new(FileCountDiagnostic::new("tas")), "tas").await;
  let good_id = good.planned.execution_id;

  let executor = SynchronousExecutor::new(h.store.clone(), h.paths());
  executor.submit(failing).await.unwrap();
  executor.submit(good).await.unwrap();

  let summary = executor.join(Duration::from_secs(1)).await.unwrap();
  assert_eq!(summary.failed, 1);
  assert_eq!(summary.succeeded, 1);

  let failed = h.store.get_execution(failing_id).await.unwrap().unwrap();
  assert_eq!(failed.status, ExecutionStatus::Failed);
  assert!(
    failed.reason.as_deref().unwrap().contains("synthetic diagnostic")
  );

  let succeeded = h.store.get_execution(good_id).await.unwrap().unwrap();
  assert_eq!(succeeded.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn invalid_metric_bundle_fails_with_no_values_recorded() {
  let h = Harness::new().await;
  let job = h.plan(Arc::new(BadBundleDiagnostic::new()), "tas").await;
  let execution_id = job.planned.execution_id;

  let executor = SynchronousExecutor::new(h.store.clone(), h.paths());
  executor.submit(job).await.unwrap();

  let row = h.store.get_execution(execution_id).await.unwrap().unwrap();
  assert_eq!(row.status, ExecutionStatus::Failed);
  assert!(row.reason.as_deref().unwrap().contains("metric bundle"));

  // Nothing was recorded for the failed execution.
  assert!(h.store.list_outputs(execution_id).await.unwrap().is_empty());
}

// ─── Local pool ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn local_pool_runs_all_submissions() {
  let h = Harness::new().await;
  let executor = LocalPoolExecutor::new(h.store.clone(), h.paths(), 2);

  let mut ids = Vec::new();
  for variable in ["tas", "pr", "ts"] {
    let job = h
      .plan(Arc::new(FileCountDiagnostic::new(variable)), variable)
      .await;
    ids.push(job.planned.execution_id);
    executor.submit(job).await.unwrap();
  }

  let summary = executor.join(Duration::from_secs(30)).await.unwrap();
  assert_eq!(summary.succeeded, 3);
  assert!(!summary.timed_out);

  for id in ids {
    let row = h.store.get_execution(id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Succeeded);
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_pool_timeout_cancels_outstanding_work() {
  let h = Harness::new().await;
  // Pool of one: the second submission stays pending.
  let executor = LocalPoolExecutor::new(h.store.clone(), h.paths(), 1);

  let first = h.plan(Arc::new(SleepyDiagnostic::new()), "tas").await;
  let second = h.plan(Arc::new(SleepyDiagnostic::new()), "pr").await;
  let ids =
    [first.planned.execution_id, second.planned.execution_id];
  executor.submit(first).await.unwrap();
  executor.submit(second).await.unwrap();

  let summary = executor.join(Duration::from_millis(300)).await.unwrap();
  assert!(summary.timed_out);
  assert_eq!(summary.cancelled, 2);

  for id in ids {
    let row = h.store.get_execution(id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Cancelled);
  }
}

#[tokio::test]
async fn cancel_before_claim_prevents_the_run() {
  let h = Harness::new().await;
  let executor = LocalPoolExecutor::new(h.store.clone(), h.paths(), 1);

  let job = h.plan(Arc::new(FileCountDiagnostic::new("tas")), "tas").await;
  let execution_id = job.planned.execution_id;

  // Cancel while still pending; the subsequent claim must lose.
  executor.cancel(execution_id).await.unwrap();
  executor.submit(job).await.unwrap();
  let summary = executor.join(Duration::from_secs(10)).await.unwrap();

  assert_eq!(summary.cancelled, 1);
  let row = h.store.get_execution(execution_id).await.unwrap().unwrap();
  assert_eq!(row.status, ExecutionStatus::Cancelled);
}

// ─── Distributed queue ───────────────────────────────────────────────────────

#[tokio::test]
async fn queue_worker_processes_submissions() {
  let h = Harness::new().await;
  let job = h.plan(Arc::new(FileCountDiagnostic::new("tas")), "tas").await;
  let execution_id = job.planned.execution_id;

  let producer = QueueExecutor::new(h.store.clone());
  producer.submit(job).await.unwrap();

  let registry = Arc::new(ProviderRegistry::new(vec![
    DiagnosticProvider::new("example", "1.0.0")
      .register(Arc::new(FileCountDiagnostic::new("tas"))),
  ]));
  let worker = QueueWorker::new(h.store.clone(), registry, h.paths());
  assert_eq!(worker.drain().await.unwrap(), 1);

  let summary = producer.join(Duration::from_secs(5)).await.unwrap();
  assert_eq!(summary.succeeded, 1);

  let row = h.store.get_execution(execution_id).await.unwrap().unwrap();
  assert_eq!(row.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn application_failures_are_not_redelivered() {
  let h = Harness::new().await;
  let job = h.plan(Arc::new(FailingDiagnostic::new()), "pr").await;
  let execution_id = job.planned.execution_id;

  let producer = QueueExecutor::new(h.store.clone());
  producer.submit(job).await.unwrap();

  let registry = Arc::new(ProviderRegistry::new(vec![
    DiagnosticProvider::new("example", "1.0.0")
      .register(Arc::new(FailingDiagnostic::new())),
  ]));
  let worker = QueueWorker::new(h.store.clone(), registry, h.paths());
  assert_eq!(worker.drain().await.unwrap(), 1);

  // The failure landed on the execution and the message is gone.
  let row = h.store.get_execution(execution_id).await.unwrap().unwrap();
  assert_eq!(row.status, ExecutionStatus::Failed);
  assert!(h.store.claim_message("probe", 10).await.unwrap().is_none());
}

#[tokio::test]
async fn workers_release_messages_for_unknown_providers() {
  let h = Harness::new().await;
  let job = h.plan(Arc::new(FileCountDiagnostic::new("tas")), "tas").await;

  let producer = QueueExecutor::new(h.store.clone());
  producer.submit(job).await.unwrap();

  // A worker with an empty registry cannot run it and must release it.
  let empty = Arc::new(ProviderRegistry::new(vec![]));
  let worker = QueueWorker::new(h.store.clone(), empty, h.paths());
  assert!(worker.poll_once().await.unwrap());

  // The message is ready again for a capable worker.
  let claimed = h.store.claim_message("capable", 5).await.unwrap();
  assert!(claimed.is_some());
  assert_eq!(claimed.unwrap().delivery_count, 2);
}

// ─── Lost workers ────────────────────────────────────────────────────────────

#[tokio::test]
async fn lost_workers_are_failed_and_retryable() {
  let h = Harness::new().await;
  let job = h.plan(Arc::new(FileCountDiagnostic::new("tas")), "tas").await;
  let execution_id = job.planned.execution_id;

  // A worker claims the execution and then dies (unreachable pid).
  h.store
    .transition_execution(
      execution_id,
      ExecutionStatus::Pending,
      ExecutionStatus::Running,
      None,
      Some("local-pool:999999999:1"),
    )
    .await
    .unwrap();

  let failed =
    fail_lost_executions(&h.store, local_worker_alive).await.unwrap();
  assert_eq!(failed, vec![execution_id]);

  let row = h.store.get_execution(execution_id).await.unwrap().unwrap();
  assert_eq!(row.status, ExecutionStatus::Failed);
  assert_eq!(row.reason.as_deref(), Some(LOST_WORKER_REASON));

  // An explicit retry re-queues it and it runs to completion.
  h.store
    .transition_execution(
      execution_id,
      ExecutionStatus::Failed,
      ExecutionStatus::Pending,
      None,
      None,
    )
    .await
    .unwrap();

  let executor = SynchronousExecutor::new(h.store.clone(), h.paths());
  executor.submit(job).await.unwrap();

  let row = h.store.get_execution(execution_id).await.unwrap().unwrap();
  assert_eq!(row.status, ExecutionStatus::Succeeded);
  assert_eq!(row.retry_count, 1);
}

// ─── HPC batch ───────────────────────────────────────────────────────────────

struct FakeScheduler {
  submitted: StdMutex<Vec<PathBuf>>,
}

impl FakeScheduler {
  fn new() -> FakeScheduler {
    FakeScheduler { submitted: StdMutex::new(Vec::new()) }
  }
}

impl hpc::Scheduler for FakeScheduler {
  fn name(&self) -> &'static str {
    "fake"
  }

  fn submit(
    &self,
    script: &Path,
  ) -> impl Future<Output = crate::Result<String>> + Send + '_ {
    let script = script.to_owned();
    async move {
      let mut submitted = self.submitted.lock().unwrap();
      submitted.push(script);
      Ok(format!("job-{}", submitted.len()))
    }
  }

  fn state(
    &self,
    _job_id: &str,
  ) -> impl Future<Output = crate::Result<hpc::JobState>> + Send + '_ {
    // Every job is already gone by the time anyone asks.
    async move { Ok(hpc::JobState::Finished) }
  }

  fn cancel(
    &self,
    _job_id: &str,
  ) -> impl Future<Output = crate::Result<()>> + Send + '_ {
    async move { Ok(()) }
  }

  fn directives(
    &self,
    _options: &hpc::HpcOptions,
    job_name: &str,
  ) -> String {
    format!("# fake scheduler: {job_name}")
  }
}

#[tokio::test]
async fn hpc_submit_writes_script_and_reconciles_lost_jobs() {
  let h = Harness::new().await;
  let job = h.plan(Arc::new(FileCountDiagnostic::new("tas")), "tas").await;
  let execution_id = job.planned.execution_id;
  let scratch_dir = job.planned.definition.output_directory.clone();

  let executor = hpc::HpcExecutor::new(
    h.store.clone(),
    FakeScheduler::new(),
    hpc::HpcOptions {
      cirrus_bin: PathBuf::from("/opt/cirrus/bin/cirrus"),
      ..Default::default()
    },
  )
  .with_poll_interval(Duration::from_millis(10));

  executor.submit(job).await.unwrap();

  // The job materials are in the execution's scratch directory.
  let script =
    std::fs::read_to_string(scratch_dir.join(hpc::SCRIPT_FILENAME)).unwrap();
  assert!(script.contains("/opt/cirrus/bin/cirrus executions run"));
  assert!(script.contains(hpc::PLANNED_FILENAME));
  assert!(scratch_dir.join(hpc::PLANNED_FILENAME).exists());

  // The scheduler reports the job finished, but the execution never left
  // pending: the run never started on the node.
  let summary = executor.join(Duration::from_secs(5)).await.unwrap();
  assert_eq!(summary.cancelled, 1);

  let row = h.store.get_execution(execution_id).await.unwrap().unwrap();
  assert_eq!(row.status, ExecutionStatus::Cancelled);
  assert!(row.reason.as_deref().unwrap().contains("without starting"));
}

#[test]
fn scheduler_directives_cover_slurm_and_pbs() {
  use hpc::Scheduler as _;

  let options = hpc::HpcOptions {
    queue:      Some("compute".to_string()),
    walltime:   Some("02:00:00".to_string()),
    cirrus_bin: PathBuf::from("cirrus"),
    extra:      vec!["#SBATCH --mem=4G".to_string()],
  };

  let slurm = hpc::SlurmScheduler.directives(&options, "cirrus-job");
  assert!(slurm.contains("--job-name=cirrus-job"));
  assert!(slurm.contains("--partition=compute"));
  assert!(slurm.contains("--time=02:00:00"));
  assert!(slurm.contains("--mem=4G"));

  let pbs_options = hpc::HpcOptions {
    extra: Vec::new(),
    ..options
  };
  let pbs = hpc::PbsScheduler.directives(&pbs_options, "cirrus-job");
  assert!(pbs.contains("-N cirrus-job"));
  assert!(pbs.contains("-q compute"));
  assert!(pbs.contains("walltime=02:00:00"));
}
