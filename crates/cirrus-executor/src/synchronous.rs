//! The synchronous executor: each submission runs to completion before
//! `submit` returns. Used for debugging and as the in-job runner for HPC
//! batch scripts.

use std::{sync::Mutex, time::Duration};

use cirrus_core::store::{EvaluationStore, ExecutionStatus};

use crate::{
  Error, ExecutionJob, Executor, ExecutorPaths, JoinSummary, Result,
  SubmissionHandle, run_job,
};

pub struct SynchronousExecutor<S> {
  store:   S,
  paths:   ExecutorPaths,
  summary: Mutex<JoinSummary>,
}

impl<S: EvaluationStore> SynchronousExecutor<S> {
  pub fn new(store: S, paths: ExecutorPaths) -> SynchronousExecutor<S> {
    SynchronousExecutor {
      store,
      paths,
      summary: Mutex::new(JoinSummary::default()),
    }
  }

  fn worker_id() -> String {
    format!("sync:{}:0", std::process::id())
  }
}

impl<S: EvaluationStore> Executor for SynchronousExecutor<S> {
  async fn submit(&self, job: ExecutionJob) -> Result<SubmissionHandle> {
    let execution_id = job.planned.execution_id;
    let status =
      run_job(&self.store, &self.paths, &job, &Self::worker_id()).await?;

    if let Ok(mut summary) = self.summary.lock() {
      summary.tally(status);
    }
    Ok(SubmissionHandle { execution_id })
  }

  async fn join(&self, _timeout: Duration) -> Result<JoinSummary> {
    // Everything already ran inside submit.
    Ok(self.summary.lock().map(|s| *s).unwrap_or_default())
  }

  async fn cancel(&self, execution_id: i64) -> Result<()> {
    // Nothing is ever in flight between calls; cancel only applies to an
    // execution still pending in the store.
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
