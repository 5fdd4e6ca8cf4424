//! Lost-worker recovery.
//!
//! On startup an orchestrator sweeps `running` executions: anything whose
//! backing worker is no longer alive is marked failed so an operator can
//! retry it.

use cirrus_core::store::{EvaluationStore, ExecutionStatus};
use tracing::{info, warn};

use crate::{Error, Result};

/// Reason recorded on executions failed by the sweep.
pub const LOST_WORKER_REASON: &str = "lost worker";

/// Whether a worker id of the form `<kind>:<pid>:<suffix>` refers to a
/// live process on this host.
pub fn local_worker_alive(worker: &str) -> bool {
  let Some(pid) = worker.split(':').nth(1) else {
    return false;
  };
  if pid.bytes().all(|b| b.is_ascii_digit()) && !pid.is_empty() {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
  } else {
    false
  }
}

/// Mark every `running` execution whose worker fails `is_alive` as failed
/// with a "lost worker" reason. Returns the ids of the executions failed.
pub async fn fail_lost_executions<S: EvaluationStore>(
  store: &S,
  is_alive: impl Fn(&str) -> bool,
) -> Result<Vec<i64>> {
  let running = store
    .executions_with_status(ExecutionStatus::Running)
    .await
    .map_err(Error::store)?;

  let mut failed = Vec::new();
  for execution in running {
    let alive = execution.worker.as_deref().is_some_and(&is_alive);
    if alive {
      continue;
    }

    warn!(
      execution_id = execution.id,
      worker = execution.worker.as_deref().unwrap_or("<none>"),
      "failing execution; its worker is gone"
    );
    let transitioned = store
      .transition_execution(
        execution.id,
        ExecutionStatus::Running,
        ExecutionStatus::Failed,
        Some(LOST_WORKER_REASON),
        None,
      )
      .await
      .map_err(Error::store)?;
    if transitioned {
      failed.push(execution.id);
    }
  }

  if !failed.is_empty() {
    info!(count = failed.len(), "recovered lost-worker executions");
  }
  Ok(failed)
}
