//! The local-pool executor: a bounded worker pool over tokio tasks.

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use cirrus_core::store::{EvaluationStore, ExecutionStatus};
use tokio::{
  sync::{Mutex, Semaphore},
  task::JoinSet,
};
use tracing::warn;

use crate::{
  Error, ExecutionJob, Executor, ExecutorPaths, JoinSummary, Result,
  SubmissionHandle, run_job,
};

pub struct LocalPoolExecutor<S> {
  store:     S,
  paths:     Arc<ExecutorPaths>,
  semaphore: Arc<Semaphore>,
  tasks:     Mutex<JoinSet<()>>,
  submitted: Mutex<Vec<i64>>,
}

impl<S> LocalPoolExecutor<S>
where
  S: EvaluationStore + Clone + 'static,
{
  /// `pool_size = 0` uses the machine's available parallelism.
  pub fn new(
    store: S,
    paths: ExecutorPaths,
    pool_size: usize,
  ) -> LocalPoolExecutor<S> {
    let pool_size = if pool_size == 0 {
      std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
      pool_size
    };
    LocalPoolExecutor {
      store,
      paths: Arc::new(paths),
      semaphore: Arc::new(Semaphore::new(pool_size)),
      tasks: Mutex::new(JoinSet::new()),
      submitted: Mutex::new(Vec::new()),
    }
  }

  /// Tally the terminal statuses of everything submitted so far.
  async fn summarize(&self, timed_out: bool) -> Result<JoinSummary> {
    let submitted = self.submitted.lock().await.clone();
    let mut summary = JoinSummary { timed_out, ..Default::default() };
    for execution_id in submitted {
      if let Some(row) = self
        .store
        .get_execution(execution_id)
        .await
        .map_err(Error::store)?
      {
        summary.tally(row.status);
      }
    }
    Ok(summary)
  }

  /// Cancel everything not yet terminal: pending rows flip to cancelled,
  /// running rows get a best-effort cancel mark once their task is gone.
  async fn cancel_outstanding(&self) -> Result<()> {
    let submitted = self.submitted.lock().await.clone();
    for execution_id in submitted {
      let Some(row) = self
        .store
        .get_execution(execution_id)
        .await
        .map_err(Error::store)?
      else {
        continue;
      };
      let from = match row.status {
        ExecutionStatus::Pending => ExecutionStatus::Pending,
        ExecutionStatus::Running => ExecutionStatus::Running,
        _ => continue,
      };
      self
        .store
        .transition_execution(
          execution_id,
          from,
          ExecutionStatus::Cancelled,
          Some("cancelled: join timeout"),
          None,
        )
        .await
        .map_err(Error::store)?;
    }
    Ok(())
  }
}

impl<S> Executor for LocalPoolExecutor<S>
where
  S: EvaluationStore + Clone + 'static,
{
  async fn submit(&self, job: ExecutionJob) -> Result<SubmissionHandle> {
    let execution_id = job.planned.execution_id;
    self.submitted.lock().await.push(execution_id);

    let store = self.store.clone();
    let paths = self.paths.clone();
    let semaphore = self.semaphore.clone();
    let worker = format!("local-pool:{}:{execution_id}", std::process::id());

    self.tasks.lock().await.spawn(async move {
      // The pool bound: at most `pool_size` diagnostics run at once.
      let Ok(_permit) = semaphore.acquire().await else {
        return;
      };
      if let Err(e) = run_job(&store, &paths, &job, &worker).await {
        warn!(execution_id, error = %e, "executor task failed");
      }
    });

    Ok(SubmissionHandle { execution_id })
  }

  async fn join(&self, timeout: Duration) -> Result<JoinSummary> {
    let deadline = Instant::now() + timeout;
    let mut tasks = self.tasks.lock().await;

    loop {
      if tasks.is_empty() {
        drop(tasks);
        return self.summarize(false).await;
      }
      let remaining = deadline.saturating_duration_since(Instant::now());
      match tokio::time::timeout(remaining, tasks.join_next()).await {
        Ok(Some(_)) => continue,
        Ok(None) => {
          drop(tasks);
          return self.summarize(false).await;
        }
        Err(_) => {
          // Timed out: abort in-flight tasks, cancel whatever has not
          // reached a terminal state, and report what we have.
          tasks.abort_all();
          while tasks.join_next().await.is_some() {}
          drop(tasks);
          self.cancel_outstanding().await?;
          return self.summarize(true).await;
        }
      }
    }
  }

  async fn cancel(&self, execution_id: i64) -> Result<()> {
    // Flipping the row to cancelled makes the worker's claim fail; a job
    // already running is left to finish.
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
