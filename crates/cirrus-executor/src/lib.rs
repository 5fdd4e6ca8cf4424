//! Execution backends.
//!
//! An executor accepts planned executions, runs the provider's diagnostic
//! in its environment, and reports results back to the store. Variants
//! share one contract: `submit` is non-blocking, `join` waits for
//! everything submitted (bounded by a timeout), `cancel` is best-effort.
//! None of them compute results themselves.

#![allow(async_fn_in_trait)]

pub mod error;
pub mod hpc;
pub mod local;
pub mod queue;
pub mod recovery;
pub mod result;
pub mod synchronous;

#[cfg(test)]
mod tests;

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use cirrus_core::{
  diagnostic::{Diagnostic, ExecutionResult, PlannedExecution},
  store::{EvaluationStore, ExecutionStatus},
};
use tracing::{debug, warn};

pub use error::{Error, Result};
pub use recovery::fail_lost_executions;
pub use result::handle_execution_result;

/// Directory layout an executor works against.
#[derive(Debug, Clone)]
pub struct ExecutorPaths {
  /// Executions write intermediate output under
  /// `<scratch_root>/<fragment>`.
  pub scratch_root:        PathBuf,
  /// Recorded outputs are copied under `<results_root>/<fragment>`.
  pub results_root:        PathBuf,
  /// Keep the scratch subtree of failed executions for debugging.
  pub keep_failed_scratch: bool,
}

impl ExecutorPaths {
  pub fn new(
    scratch_root: impl Into<PathBuf>,
    results_root: impl Into<PathBuf>,
  ) -> ExecutorPaths {
    ExecutorPaths {
      scratch_root:        scratch_root.into(),
      results_root:        results_root.into(),
      keep_failed_scratch: true,
    }
  }
}

/// One unit of work handed to an executor: the persisted execution plus
/// the in-process diagnostic to run.
#[derive(Clone)]
pub struct ExecutionJob {
  pub planned:    PlannedExecution,
  pub diagnostic: Arc<dyn Diagnostic>,
}

impl ExecutionJob {
  /// `<provider>/<diagnostic>` routing key.
  pub fn topic(&self) -> String {
    format!("{}/{}", self.planned.provider_slug, self.planned.diagnostic_slug)
  }
}

/// Returned by [`Executor::submit`]; completion is observed via
/// [`Executor::join`] or the store.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionHandle {
  pub execution_id: i64,
}

/// Tally of terminal states after a [`Executor::join`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinSummary {
  pub succeeded: usize,
  pub failed:    usize,
  pub cancelled: usize,
  /// The join gave up before every submission terminated.
  pub timed_out: bool,
}

impl JoinSummary {
  pub fn tally(&mut self, status: ExecutionStatus) {
    match status {
      ExecutionStatus::Succeeded => self.succeeded += 1,
      ExecutionStatus::Failed => self.failed += 1,
      ExecutionStatus::Cancelled => self.cancelled += 1,
      ExecutionStatus::Pending | ExecutionStatus::Running => {}
    }
  }

  /// Whether the whole batch finished cleanly.
  pub fn all_succeeded(&self) -> bool {
    !self.timed_out && self.failed == 0 && self.cancelled == 0
  }
}

/// The executor contract.
pub trait Executor: Send + Sync {
  /// Accept an execution; non-blocking for asynchronous variants.
  fn submit(
    &self,
    job: ExecutionJob,
  ) -> impl Future<Output = Result<SubmissionHandle>> + Send + '_;

  /// Wait for all submitted executions to terminate, or until `timeout`.
  /// On timeout, outstanding pending executions are cancelled and running
  /// ones receive a best-effort termination request.
  fn join(
    &self,
    timeout: Duration,
  ) -> impl Future<Output = Result<JoinSummary>> + Send + '_;

  /// Best-effort cancellation of one execution.
  fn cancel(
    &self,
    execution_id: i64,
  ) -> impl Future<Output = Result<()>> + Send + '_;
}

// ─── Shared run path ─────────────────────────────────────────────────────────

/// Run one job to completion in this process: claim it, invoke the
/// diagnostic, and record the outcome.
///
/// Returns the execution's final status. Losing the claim race is not an
/// error; the current status is returned untouched. Diagnostic failures
/// (error return, panic) land on the execution row, never propagate.
pub async fn run_job<S: EvaluationStore>(
  store: &S,
  paths: &ExecutorPaths,
  job: &ExecutionJob,
  worker: &str,
) -> Result<ExecutionStatus> {
  let execution_id = job.planned.execution_id;

  let taken = store
    .transition_execution(
      execution_id,
      ExecutionStatus::Pending,
      ExecutionStatus::Running,
      None,
      Some(worker),
    )
    .await
    .map_err(Error::store)?;
  if !taken {
    let status = store
      .get_execution(execution_id)
      .await
      .map_err(Error::store)?
      .map(|row| row.status)
      .unwrap_or(ExecutionStatus::Cancelled);
    debug!(
      execution_id,
      status = %status,
      "execution was taken or cancelled before this worker claimed it"
    );
    return Ok(status);
  }

  tokio::fs::create_dir_all(&job.planned.definition.output_directory)
    .await?;
  append_log(
    &job.planned.definition.log_path(),
    &format!(
      "starting {}/{} execution {execution_id} on {worker}",
      job.planned.provider_slug, job.planned.diagnostic_slug
    ),
  );

  // Diagnostics are synchronous and potentially long-running; keep them
  // off the async runtime.
  let diagnostic = job.diagnostic.clone();
  let definition = job.planned.definition.clone();
  let outcome = tokio::task::spawn_blocking(move || {
    diagnostic
      .execute(&definition)
      .and_then(|_| diagnostic.build_execution_result(&definition))
  })
  .await;

  let (result, failure_reason) = match outcome {
    Ok(Ok(result)) => (result, None),
    Ok(Err(e)) => {
      warn!(execution_id, error = %e, "diagnostic execution failed");
      (ExecutionResult::from_failure(), Some(e.to_string()))
    }
    Err(join_error) => {
      warn!(execution_id, error = %join_error, "diagnostic panicked");
      (
        ExecutionResult::from_failure(),
        Some(format!("diagnostic panicked: {join_error}")),
      )
    }
  };
  append_log(
    &job.planned.definition.log_path(),
    failure_reason.as_deref().unwrap_or("diagnostic finished"),
  );

  let status =
    handle_execution_result(store, paths, job, &result, failure_reason)
      .await?;

  // Scratch is per-execution and exclusive to this worker: remove it on
  // success, keep it for debugging on failure if configured.
  let scratch = &job.planned.definition.output_directory;
  if status == ExecutionStatus::Succeeded || !paths.keep_failed_scratch {
    if let Err(e) = tokio::fs::remove_dir_all(scratch).await {
      warn!(
        path = %scratch.display(),
        error = %e,
        "failed to remove scratch directory"
      );
    }
  }

  Ok(status)
}

/// Append one line to the execution log; log capture must never fail the
/// execution itself.
fn append_log(path: &std::path::Path, line: &str) {
  use std::io::Write as _;
  let opened = std::fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(path);
  match opened {
    Ok(mut file) => {
      let _ = writeln!(file, "{line}");
    }
    Err(e) => {
      debug!(path = %path.display(), error = %e, "cannot write execution log");
    }
  }
}
