//! The HPC batch executor.
//!
//! `submit` serializes the planned execution next to its scratch
//! directory, renders a scheduler job script that re-runs it through the
//! `cirrus` binary, and hands the script to the scheduler. A master
//! process polls job states; a job reaching a terminal state without its
//! execution reaching one is treated as a lost worker.

use std::{
  collections::HashMap,
  future::Future,
  path::{Path, PathBuf},
  time::{Duration, Instant},
};

use cirrus_core::store::{EvaluationStore, ExecutionStatus};
use tokio::{process::Command, sync::Mutex};
use tracing::{info, warn};

use crate::{
  Error, ExecutionJob, Executor, JoinSummary, Result, SubmissionHandle,
};

/// Filename of the serialized planned execution inside the scratch
/// directory.
pub const PLANNED_FILENAME: &str = "execution.json";

/// Filename of the generated job script inside the scratch directory.
pub const SCRIPT_FILENAME: &str = "job.sh";

/// Coarse scheduler-side job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  Queued,
  Running,
  /// Terminal as far as the scheduler is concerned; success is judged
  /// from the execution row, not the job.
  Finished,
  Unknown,
}

impl JobState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, JobState::Finished)
  }
}

/// A batch scheduler the executor can target. Implementations shell out
/// to the site's submission tools.
pub trait Scheduler: Send + Sync {
  fn name(&self) -> &'static str;

  /// Submit a job script; returns the scheduler's job id.
  fn submit(
    &self,
    script: &Path,
  ) -> impl Future<Output = Result<String>> + Send + '_;

  fn state(
    &self,
    job_id: &str,
  ) -> impl Future<Output = Result<JobState>> + Send + '_;

  fn cancel(
    &self,
    job_id: &str,
  ) -> impl Future<Output = Result<()>> + Send + '_;

  /// Render the `#...` directive block at the top of a job script.
  fn directives(&self, options: &HpcOptions, job_name: &str) -> String;
}

/// Site- and deployment-specific options.
#[derive(Debug, Clone)]
pub struct HpcOptions {
  /// Partition (slurm) or queue (pbs) to submit into.
  pub queue:      Option<String>,
  /// Wall-clock limit in scheduler syntax, e.g. `02:00:00`.
  pub walltime:   Option<String>,
  /// Path of the `cirrus` binary on the compute nodes.
  pub cirrus_bin: PathBuf,
  /// Extra raw directive lines appended verbatim.
  pub extra:      Vec<String>,
}

impl Default for HpcOptions {
  fn default() -> HpcOptions {
    HpcOptions {
      queue:      None,
      walltime:   None,
      cirrus_bin: std::env::current_exe()
        .unwrap_or_else(|_| PathBuf::from("cirrus")),
      extra:      Vec::new(),
    }
  }
}

// ─── slurm ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SlurmScheduler;

impl Scheduler for SlurmScheduler {
  fn name(&self) -> &'static str {
    "slurm"
  }

  fn submit(
    &self,
    script: &Path,
  ) -> impl Future<Output = Result<String>> + Send + '_ {
    let script = script.to_owned();
    async move {
      let output = Command::new("sbatch")
        .arg("--parsable")
        .arg(&script)
        .output()
        .await
        .map_err(|e| {
          Error::Scheduler(format!("sbatch failed to start: {e}"))
        })?;
      if !output.status.success() {
        return Err(Error::Scheduler(format!(
          "sbatch exited with {}: {}",
          output.status,
          String::from_utf8_lossy(&output.stderr)
        )));
      }
      // `--parsable` prints `<jobid>[;<cluster>]`.
      let stdout = String::from_utf8_lossy(&output.stdout);
      Ok(stdout.trim().split(';').next().unwrap_or_default().to_string())
    }
  }

  fn state(
    &self,
    job_id: &str,
  ) -> impl Future<Output = Result<JobState>> + Send + '_ {
    let job_id = job_id.to_owned();
    async move {
      let output = Command::new("squeue")
        .args(["-h", "-j", &job_id, "-o", "%T"])
        .output()
        .await
        .map_err(|e| {
          Error::Scheduler(format!("squeue failed to start: {e}"))
        })?;
      let stdout = String::from_utf8_lossy(&output.stdout);
      let state = stdout.trim();
      Ok(match state {
        // Absent from the queue means the job has finished.
        "" => JobState::Finished,
        "PENDING" | "CONFIGURING" => JobState::Queued,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" | "FAILED" | "CANCELLED" | "TIMEOUT" | "OUT_OF_MEMORY" => {
          JobState::Finished
        }
        _ => JobState::Unknown,
      })
    }
  }

  fn cancel(
    &self,
    job_id: &str,
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    let job_id = job_id.to_owned();
    async move {
      let status = Command::new("scancel")
        .arg(&job_id)
        .status()
        .await
        .map_err(|e| Error::Scheduler(format!("scancel failed: {e}")))?;
      if !status.success() {
        warn!(job_id, "scancel exited with {status}");
      }
      Ok(())
    }
  }

  fn directives(&self, options: &HpcOptions, job_name: &str) -> String {
    let mut lines = vec![format!("#SBATCH --job-name={job_name}")];
    if let Some(queue) = &options.queue {
      lines.push(format!("#SBATCH --partition={queue}"));
    }
    if let Some(walltime) = &options.walltime {
      lines.push(format!("#SBATCH --time={walltime}"));
    }
    lines.extend(options.extra.iter().cloned());
    lines.join("\n")
  }
}

// ─── pbs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PbsScheduler;

impl Scheduler for PbsScheduler {
  fn name(&self) -> &'static str {
    "pbs"
  }

  fn submit(
    &self,
    script: &Path,
  ) -> impl Future<Output = Result<String>> + Send + '_ {
    let script = script.to_owned();
    async move {
      let output = Command::new("qsub")
        .arg(&script)
        .output()
        .await
        .map_err(|e| {
          Error::Scheduler(format!("qsub failed to start: {e}"))
        })?;
      if !output.status.success() {
        return Err(Error::Scheduler(format!(
          "qsub exited with {}: {}",
          output.status,
          String::from_utf8_lossy(&output.stderr)
        )));
      }
      Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
  }

  fn state(
    &self,
    job_id: &str,
  ) -> impl Future<Output = Result<JobState>> + Send + '_ {
    let job_id = job_id.to_owned();
    async move {
      let output = Command::new("qstat")
        .args(["-x", &job_id])
        .output()
        .await
        .map_err(|e| {
          Error::Scheduler(format!("qstat failed to start: {e}"))
        })?;
      if !output.status.success() {
        // Unknown job: finished and aged out of qstat history.
        return Ok(JobState::Finished);
      }
      let stdout = String::from_utf8_lossy(&output.stdout);
      Ok(if stdout.contains("<job_state>Q</job_state>") {
        JobState::Queued
      } else if stdout.contains("<job_state>R</job_state>") {
        JobState::Running
      } else if stdout.contains("<job_state>F</job_state>") {
        JobState::Finished
      } else {
        JobState::Unknown
      })
    }
  }

  fn cancel(
    &self,
    job_id: &str,
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    let job_id = job_id.to_owned();
    async move {
      let status = Command::new("qdel")
        .arg(&job_id)
        .status()
        .await
        .map_err(|e| Error::Scheduler(format!("qdel failed: {e}")))?;
      if !status.success() {
        warn!(job_id, "qdel exited with {status}");
      }
      Ok(())
    }
  }

  fn directives(&self, options: &HpcOptions, job_name: &str) -> String {
    let mut lines = vec![format!("#PBS -N {job_name}")];
    if let Some(queue) = &options.queue {
      lines.push(format!("#PBS -q {queue}"));
    }
    if let Some(walltime) = &options.walltime {
      lines.push(format!("#PBS -l walltime={walltime}"));
    }
    lines.extend(options.extra.iter().cloned());
    lines.join("\n")
  }
}

// ─── Script rendering ────────────────────────────────────────────────────────

/// Render the job script that re-runs a planned execution on a compute
/// node via the `cirrus` binary.
pub fn render_job_script<C: Scheduler>(
  scheduler: &C,
  options: &HpcOptions,
  job: &ExecutionJob,
  planned_path: &Path,
) -> String {
  let job_name = format!(
    "cirrus-{}-{}-{}",
    job.planned.provider_slug,
    job.planned.diagnostic_slug,
    job.planned.execution_id
  );
  format!(
    "#!/usr/bin/env bash\n{}\nset -euo pipefail\nexec {} executions run \
     --planned {}\n",
    scheduler.directives(options, &job_name),
    options.cirrus_bin.display(),
    planned_path.display(),
  )
}

// ─── Executor ────────────────────────────────────────────────────────────────

pub struct HpcExecutor<S, C> {
  store:         S,
  scheduler:     C,
  options:       HpcOptions,
  poll_interval: Duration,
  /// execution id → scheduler job id.
  jobs:          Mutex<HashMap<i64, String>>,
}

impl<S, C> HpcExecutor<S, C>
where
  S: EvaluationStore,
  C: Scheduler,
{
  pub fn new(
    store: S,
    scheduler: C,
    options: HpcOptions,
  ) -> HpcExecutor<S, C> {
    HpcExecutor {
      store,
      scheduler,
      options,
      poll_interval: Duration::from_secs(15),
      jobs: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// Reconcile one terminal scheduler job with its execution row.
  async fn reconcile_finished(&self, execution_id: i64) -> Result<()> {
    let Some(row) = self
      .store
      .get_execution(execution_id)
      .await
      .map_err(Error::store)?
    else {
      return Ok(());
    };
    match row.status {
      // The remote run never claimed the execution.
      ExecutionStatus::Pending => {
        self
          .store
          .transition_execution(
            execution_id,
            ExecutionStatus::Pending,
            ExecutionStatus::Cancelled,
            Some("scheduler job finished without starting the execution"),
            None,
          )
          .await
          .map_err(Error::store)?;
      }
      // The remote run died mid-flight.
      ExecutionStatus::Running => {
        self
          .store
          .transition_execution(
            execution_id,
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            Some("lost worker: scheduler job finished mid-execution"),
            None,
          )
          .await
          .map_err(Error::store)?;
      }
      _ => {}
    }
    Ok(())
  }

  async fn summarize(&self, timed_out: bool) -> Result<JoinSummary> {
    let jobs = self.jobs.lock().await;
    let mut summary = JoinSummary { timed_out, ..Default::default() };
    for execution_id in jobs.keys() {
      if let Some(row) = self
        .store
        .get_execution(*execution_id)
        .await
        .map_err(Error::store)?
      {
        summary.tally(row.status);
      }
    }
    Ok(summary)
  }
}

impl<S, C> Executor for HpcExecutor<S, C>
where
  S: EvaluationStore,
  C: Scheduler,
{
  async fn submit(&self, job: ExecutionJob) -> Result<SubmissionHandle> {
    let execution_id = job.planned.execution_id;
    let scratch = &job.planned.definition.output_directory;
    tokio::fs::create_dir_all(scratch).await?;

    let planned_path = scratch.join(PLANNED_FILENAME);
    tokio::fs::write(&planned_path, serde_json::to_vec_pretty(&job.planned)?)
      .await?;

    let script = render_job_script(
      &self.scheduler,
      &self.options,
      &job,
      &planned_path,
    );
    let script_path = scratch.join(SCRIPT_FILENAME);
    tokio::fs::write(&script_path, script).await?;

    let job_id = self.scheduler.submit(&script_path).await?;
    info!(
      execution_id,
      job_id = %job_id,
      scheduler = self.scheduler.name(),
      "submitted batch job"
    );
    self.jobs.lock().await.insert(execution_id, job_id);

    Ok(SubmissionHandle { execution_id })
  }

  async fn join(&self, timeout: Duration) -> Result<JoinSummary> {
    let deadline = Instant::now() + timeout;

    loop {
      let tracked: Vec<(i64, String)> = self
        .jobs
        .lock()
        .await
        .iter()
        .map(|(id, job)| (*id, job.clone()))
        .collect();

      let mut outstanding = false;
      for (execution_id, job_id) in tracked {
        let row = self
          .store
          .get_execution(execution_id)
          .await
          .map_err(Error::store)?;
        if row.is_some_and(|r| r.status.is_terminal()) {
          continue;
        }
        if self.scheduler.state(&job_id).await?.is_terminal() {
          self.reconcile_finished(execution_id).await?;
        } else {
          outstanding = true;
        }
      }

      if !outstanding {
        return self.summarize(false).await;
      }
      if Instant::now() >= deadline {
        let jobs = self.jobs.lock().await.clone();
        for (execution_id, job_id) in jobs {
          self.scheduler.cancel(&job_id).await?;
          // Pending rows flip to cancelled; running ones are reconciled on
          // the next recovery pass.
          self
            .store
            .transition_execution(
              execution_id,
              ExecutionStatus::Pending,
              ExecutionStatus::Cancelled,
              Some("cancelled: join timeout"),
              None,
            )
            .await
            .map_err(Error::store)?;
        }
        return self.summarize(true).await;
      }
      tokio::time::sleep(self.poll_interval).await;
    }
  }

  async fn cancel(&self, execution_id: i64) -> Result<()> {
    if let Some(job_id) = self.jobs.lock().await.get(&execution_id).cloned()
    {
      self.scheduler.cancel(&job_id).await?;
    }
    // A compare-and-set miss is fine (the job already left pending);
    // store errors are not.
    self
      .store
      .transition_execution(
        execution_id,
        ExecutionStatus::Pending,
        ExecutionStatus::Cancelled,
        Some("cancelled"),
        None,
      )
      .await
      .map_err(Error::store)?;
    Ok(())
  }
}
