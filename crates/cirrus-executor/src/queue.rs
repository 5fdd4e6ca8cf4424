//! The distributed-queue executor.
//!
//! The broker is the shared datastore: `submit` enqueues a message keyed
//! by `(provider, diagnostic)` with the serialized planned execution as
//! payload; workers (usually on other hosts) claim messages with a
//! compare-and-set and run them against the same store and results
//! directory. Transient failures release the message for redelivery up to
//! a delivery bound; application failures land on the execution row and
//! are final.

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use cirrus_core::{
  diagnostic::PlannedExecution,
  provider::ProviderRegistry,
  store::{EvaluationStore, ExecutionStatus},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
  Error, ExecutionJob, Executor, ExecutorPaths, JoinSummary, Result,
  SubmissionHandle, run_job,
};

/// Redelivery bound for transiently failed messages.
pub const DEFAULT_MAX_DELIVERIES: u32 = 3;

/// How often `join` re-checks submitted executions.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ─── Producer side ───────────────────────────────────────────────────────────

pub struct QueueExecutor<S> {
  store:     S,
  submitted: Mutex<Vec<i64>>,
}

impl<S: EvaluationStore> QueueExecutor<S> {
  pub fn new(store: S) -> QueueExecutor<S> {
    QueueExecutor { store, submitted: Mutex::new(Vec::new()) }
  }
}

impl<S: EvaluationStore> Executor for QueueExecutor<S> {
  async fn submit(&self, job: ExecutionJob) -> Result<SubmissionHandle> {
    let execution_id = job.planned.execution_id;
    let payload = serde_json::to_string(&job.planned)?;

    self
      .store
      .enqueue_message(&job.topic(), execution_id, &payload)
      .await
      .map_err(Error::store)?;
    self.submitted.lock().await.push(execution_id);

    Ok(SubmissionHandle { execution_id })
  }

  async fn join(&self, timeout: Duration) -> Result<JoinSummary> {
    let deadline = Instant::now() + timeout;
    let submitted = self.submitted.lock().await.clone();

    loop {
      let mut summary = JoinSummary::default();
      let mut outstanding = false;

      for execution_id in &submitted {
        match self
          .store
          .get_execution(*execution_id)
          .await
          .map_err(Error::store)?
        {
          Some(row) if row.status.is_terminal() => summary.tally(row.status),
          _ => outstanding = true,
        }
      }

      if !outstanding {
        return Ok(summary);
      }
      if Instant::now() >= deadline {
        for execution_id in &submitted {
          self.cancel(*execution_id).await?;
        }
        summary.timed_out = true;
        return Ok(summary);
      }
      tokio::time::sleep(JOIN_POLL_INTERVAL).await;
    }
  }

  async fn cancel(&self, execution_id: i64) -> Result<()> {
    // The queue message may still exist; a worker claiming it later finds
    // the execution cancelled and drops the message.
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

// ─── Consumer side ───────────────────────────────────────────────────────────

/// A queue worker: claims messages and runs them with its own provider
/// registry.
pub struct QueueWorker<S> {
  store:          S,
  registry:       Arc<ProviderRegistry>,
  paths:          ExecutorPaths,
  worker_id:      String,
  max_deliveries: u32,
}

impl<S: EvaluationStore> QueueWorker<S> {
  pub fn new(
    store: S,
    registry: Arc<ProviderRegistry>,
    paths: ExecutorPaths,
  ) -> QueueWorker<S> {
    QueueWorker {
      store,
      registry,
      paths,
      worker_id: format!("queue:{}:worker", std::process::id()),
      max_deliveries: DEFAULT_MAX_DELIVERIES,
    }
  }

  pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
    self.max_deliveries = max_deliveries;
    self
  }

  /// Claim and process one message. Returns `false` when the queue is
  /// empty.
  pub async fn poll_once(&self) -> Result<bool> {
    let Some(message) = self
      .store
      .claim_message(&self.worker_id, self.max_deliveries)
      .await
      .map_err(Error::store)?
    else {
      return Ok(false);
    };

    let planned: PlannedExecution =
      match serde_json::from_str(&message.payload) {
        Ok(planned) => planned,
        Err(e) => {
          // Poison message; never redeliver.
          warn!(
            message_id = message.id,
            error = %e,
            "dropping undecodable queue message"
          );
          self
            .store
            .complete_message(message.id)
            .await
            .map_err(Error::store)?;
          return Ok(true);
        }
      };

    let diagnostic = match self
      .registry
      .lookup(&planned.provider_slug, &planned.diagnostic_slug)
    {
      Ok(diagnostic) => diagnostic,
      Err(e) => {
        // This worker does not carry the provider; release the message so
        // one that does can take it.
        debug!(
          topic = %message.topic,
          error = %e,
          "releasing message for a worker with the right provider"
        );
        self
          .store
          .release_message(message.id)
          .await
          .map_err(Error::store)?;
        return Ok(true);
      }
    };

    let job = ExecutionJob { planned, diagnostic };
    match run_job(&self.store, &self.paths, &job, &self.worker_id).await {
      Ok(_status) => {
        // Application failures are terminal: the execution row carries the
        // failure and the message is done either way.
        self
          .store
          .complete_message(message.id)
          .await
          .map_err(Error::store)?;
      }
      Err(e) => {
        // Infrastructure trouble (store unavailable mid-run, broker
        // hiccup): redeliver up to the bound.
        warn!(
          message_id = message.id,
          delivery = message.delivery_count,
          error = %e,
          "transient failure; releasing message for redelivery"
        );
        self
          .store
          .release_message(message.id)
          .await
          .map_err(Error::store)?;
      }
    }
    Ok(true)
  }

  /// Process messages until the queue is empty; returns how many were
  /// handled.
  pub async fn drain(&self) -> Result<usize> {
    let mut handled = 0;
    while self.poll_once().await? {
      handled += 1;
    }
    Ok(handled)
  }

  /// Serve the queue until `shutdown` resolves.
  pub async fn run(
    &self,
    poll_interval: Duration,
    shutdown: impl std::future::Future<Output = ()>,
  ) -> Result<usize> {
    tokio::pin!(shutdown);
    let mut handled = 0;
    loop {
      tokio::select! {
        _ = &mut shutdown => return Ok(handled),
        processed = self.poll_once() => {
          if processed? {
            handled += 1;
          } else {
            tokio::time::sleep(poll_interval).await;
          }
        }
      }
    }
  }
}
