//! The `EvaluationStore` trait and supporting row types.
//!
//! The trait is implemented by storage backends (e.g.
//! `cirrus-store-sqlite`). Higher layers (`cirrus-solver`,
//! `cirrus-executor`, `cirrus-cli`) depend on this abstraction, not on any
//! concrete backend. Rows carry surrogate keys only; nothing holds live
//! references across transaction boundaries.

use std::{collections::BTreeMap, fmt, future::Future, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  dataset::{DataCatalog, DatasetRef, GroupKey, SourceType, TimeRange},
  metrics::{ScalarMetricValue, SeriesMetricValue},
};

// ─── Execution status ────────────────────────────────────────────────────────

/// Lifecycle state of an execution.
///
/// ```text
/// pending --submit--> running --ok-->  succeeded
///    |                    \--err-->    failed
///    |                    \--cancel--> cancelled
///    \--cancel--> cancelled
/// failed --retry--> pending
/// ```
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
  Pending,
  Running,
  Succeeded,
  Failed,
  Cancelled,
}

impl ExecutionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ExecutionStatus::Pending => "pending",
      ExecutionStatus::Running => "running",
      ExecutionStatus::Succeeded => "succeeded",
      ExecutionStatus::Failed => "failed",
      ExecutionStatus::Cancelled => "cancelled",
    }
  }

  pub fn parse(s: &str) -> Option<ExecutionStatus> {
    match s {
      "pending" => Some(ExecutionStatus::Pending),
      "running" => Some(ExecutionStatus::Running),
      "succeeded" => Some(ExecutionStatus::Succeeded),
      "failed" => Some(ExecutionStatus::Failed),
      "cancelled" => Some(ExecutionStatus::Cancelled),
      _ => None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      ExecutionStatus::Succeeded
        | ExecutionStatus::Failed
        | ExecutionStatus::Cancelled
    )
  }

  /// Whether the state machine permits `from → to`.
  pub fn can_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    use ExecutionStatus::*;
    matches!(
      (from, to),
      (Pending, Running)
        | (Pending, Cancelled)
        | (Running, Succeeded)
        | (Running, Failed)
        | (Running, Cancelled)
        | (Failed, Pending)
    )
  }
}

impl fmt::Display for ExecutionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ─── Output types ────────────────────────────────────────────────────────────

/// The kind of file an execution produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
  Html,
  NetCdf,
  Csv,
  Png,
  Json,
  Log,
}

impl OutputType {
  pub fn as_str(&self) -> &'static str {
    match self {
      OutputType::Html => "html",
      OutputType::NetCdf => "nc",
      OutputType::Csv => "csv",
      OutputType::Png => "png",
      OutputType::Json => "json",
      OutputType::Log => "log",
    }
  }

  pub fn parse(s: &str) -> Option<OutputType> {
    match s {
      "html" => Some(OutputType::Html),
      "nc" => Some(OutputType::NetCdf),
      "csv" => Some(OutputType::Csv),
      "png" => Some(OutputType::Png),
      "json" => Some(OutputType::Json),
      "log" => Some(OutputType::Log),
      _ => None,
    }
  }

  /// Best-effort classification from a filename extension.
  pub fn from_filename(filename: &str) -> Option<OutputType> {
    let ext = filename.rsplit('.').next()?;
    match ext {
      "html" | "htm" => Some(OutputType::Html),
      "nc" => Some(OutputType::NetCdf),
      "csv" => Some(OutputType::Csv),
      "png" => Some(OutputType::Png),
      "json" => Some(OutputType::Json),
      "log" | "txt" => Some(OutputType::Log),
      _ => None,
    }
  }

  pub fn mime_type(&self) -> &'static str {
    match self {
      OutputType::Html => "text/html",
      OutputType::NetCdf => "application/netcdf",
      OutputType::Csv => "text/csv",
      OutputType::Png => "image/png",
      OutputType::Json => "application/json",
      OutputType::Log => "text/plain",
    }
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRow {
  pub id:      i64,
  pub slug:    String,
  pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRow {
  pub id:          i64,
  pub provider_id: i64,
  pub slug:        String,
}

/// Input to [`EvaluationStore::insert_dataset`]: one dataset with its files.
#[derive(Debug, Clone)]
pub struct NewDataset {
  pub source_type: SourceType,
  pub instance_id: String,
  pub version:     String,
  pub facets:      BTreeMap<String, String>,
  pub files:       Vec<NewFile>,
}

#[derive(Debug, Clone)]
pub struct NewFile {
  pub path:        PathBuf,
  pub size:        u64,
  pub checksum:    String,
  pub variable_id: Option<String>,
  pub time_range:  Option<TimeRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionGroupRow {
  pub id:            i64,
  pub diagnostic_id: i64,
  pub group_key:     GroupKey,
  pub dirty:         bool,
  /// Set when the group's diagnostic disappeared from the registry or its
  /// datasets were withdrawn; stale groups are kept, never deleted.
  pub stale:         bool,
  pub created_at:    DateTime<Utc>,
  pub updated_at:    DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRow {
  pub id:              i64,
  pub group_id:        i64,
  pub dataset_hash:    String,
  pub status:          ExecutionStatus,
  /// Human-readable reason for the latest terminal transition.
  pub reason:          Option<String>,
  /// Directory of this execution's results, relative to the results root.
  pub output_fragment: String,
  pub retry_count:     u32,
  /// Identity of the worker that took the execution, for lost-worker
  /// recovery.
  pub worker:          Option<String>,
  pub started_at:      Option<DateTime<Utc>>,
  pub finished_at:     Option<DateTime<Utc>>,
  pub created_at:      DateTime<Utc>,
}

/// Input to [`EvaluationStore::create_execution`].
#[derive(Debug, Clone)]
pub struct NewExecution {
  pub group_id:        i64,
  pub dataset_hash:    String,
  /// `<provider>/<diagnostic>/<group-key-slug>`; the store appends the
  /// execution id to form the output fragment.
  pub fragment_prefix: String,
  pub inputs:          Vec<(SourceType, DatasetRef)>,
}

/// One file recorded from a successful execution's output bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
  pub output_type: OutputType,
  /// Path relative to the execution's results directory. Absolute paths are
  /// rejected at the store boundary.
  pub filename:    String,
  pub mime_type:   String,
  pub short_name:  String,
  pub long_name:   Option<String>,
  pub description: Option<String>,
}

/// Filters for [`EvaluationStore::list_groups`].
#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
  /// Substring match on the provider slug (case-sensitive).
  pub provider:   Option<String>,
  /// Substring match on the diagnostic slug (case-sensitive).
  pub diagnostic: Option<String>,
  pub dirty:      Option<bool>,
  /// Filter on whether the latest execution succeeded.
  pub successful: Option<bool>,
}

/// A group joined with its provider/diagnostic slugs and latest execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupWithLatest {
  pub group:           ExecutionGroupRow,
  pub provider_slug:   String,
  pub diagnostic_slug: String,
  pub latest:          Option<ExecutionRow>,
}

/// A message claimed from the store-backed work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
  pub id:             i64,
  /// `<provider>/<diagnostic>` routing key.
  pub topic:          String,
  pub execution_id:   i64,
  /// Serialized planned execution; consumers deserialize and run it.
  pub payload:        String,
  pub delivery_count: u32,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the evaluation datastore.
///
/// All methods return `Send` futures so the trait can be used from
/// multi-threaded async runtimes. Implementations enforce the store
/// invariants: unique `(diagnostic, group_key)`, unique `(group,
/// dataset_hash)`, at most one running execution per group, and the status
/// state machine.
pub trait EvaluationStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Providers and diagnostics ─────────────────────────────────────────

  /// Upsert a provider row; idempotent on slug.
  fn register_provider(
    &self,
    slug: &str,
    version: &str,
  ) -> impl Future<Output = Result<ProviderRow, Self::Error>> + Send + '_;

  /// Upsert a diagnostic row; idempotent on `(provider, slug)`.
  fn register_diagnostic(
    &self,
    provider_id: i64,
    slug: &str,
  ) -> impl Future<Output = Result<DiagnosticRow, Self::Error>> + Send + '_;

  fn find_diagnostic(
    &self,
    provider_slug: &str,
    diagnostic_slug: &str,
  ) -> impl Future<Output = Result<Option<DiagnosticRow>, Self::Error>> + Send + '_;

  /// Flag execution groups stale when their diagnostic is no longer in
  /// `registered` (pairs of provider and diagnostic slug). Returns the
  /// number of groups flagged.
  fn flag_stale_groups(
    &self,
    registered: &[(String, String)],
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  // ── Catalog ───────────────────────────────────────────────────────────

  /// Insert a dataset with its files. Idempotent: re-inserting an identical
  /// dataset returns the existing id with `created = false`; a new version
  /// of the same instance id creates a new row and supersedes the prior as
  /// the active version.
  fn insert_dataset(
    &self,
    dataset: NewDataset,
  ) -> impl Future<Output = Result<(i64, bool), Self::Error>> + Send + '_;

  /// Soft-delete every version of a dataset. Returns the number of rows
  /// flagged.
  fn retract_dataset(
    &self,
    source_type: SourceType,
    instance_id: &str,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// The active catalog view: file-level entries of the latest
  /// non-retracted version of each dataset.
  fn load_catalog(
    &self,
    source_type: SourceType,
  ) -> impl Future<Output = Result<DataCatalog, Self::Error>> + Send + '_;

  // ── Execution groups ──────────────────────────────────────────────────

  /// Get or create the group for `(diagnostic, key)`. New groups start
  /// dirty.
  fn ensure_group(
    &self,
    diagnostic_id: i64,
    key: &GroupKey,
  ) -> impl Future<Output = Result<(ExecutionGroupRow, bool), Self::Error>> + Send + '_;

  fn latest_execution(
    &self,
    group_id: i64,
  ) -> impl Future<Output = Result<Option<ExecutionRow>, Self::Error>> + Send + '_;

  /// The execution of a group with a given dataset hash, if any.
  fn find_execution(
    &self,
    group_id: i64,
    dataset_hash: &str,
  ) -> impl Future<Output = Result<Option<ExecutionRow>, Self::Error>> + Send + '_;

  /// Flag a group whose resolved candidate vanished. Stale groups are
  /// retained, never deleted.
  fn mark_group_stale(
    &self,
    group_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn mark_group_clean(
    &self,
    group_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn mark_group_dirty(
    &self,
    group_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn list_groups(
    &self,
    filter: &GroupFilter,
  ) -> impl Future<Output = Result<Vec<GroupWithLatest>, Self::Error>> + Send + '_;

  // ── Executions ────────────────────────────────────────────────────────

  /// Create a pending execution and its input links. Enforces
  /// `(group, dataset_hash)` uniqueness.
  fn create_execution(
    &self,
    spec: NewExecution,
  ) -> impl Future<Output = Result<ExecutionRow, Self::Error>> + Send + '_;

  fn get_execution(
    &self,
    execution_id: i64,
  ) -> impl Future<Output = Result<Option<ExecutionRow>, Self::Error>> + Send + '_;

  /// Compare-and-set status transition.
  ///
  /// Returns `false` when the execution was not in `from` (lost the race).
  /// A `from → to` pair the state machine forbids is a consistency error.
  /// `running` records `worker` and `started_at`; terminal states record
  /// `finished_at` and `reason`; retry (`failed → pending`) increments the
  /// retry count.
  fn transition_execution(
    &self,
    execution_id: i64,
    from: ExecutionStatus,
    to: ExecutionStatus,
    reason: Option<&str>,
    worker: Option<&str>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn executions_with_status(
    &self,
    status: ExecutionStatus,
  ) -> impl Future<Output = Result<Vec<ExecutionRow>, Self::Error>> + Send + '_;

  /// The datasets recorded as inputs of an execution.
  fn execution_inputs(
    &self,
    execution_id: i64,
  ) -> impl Future<Output = Result<Vec<(SourceType, DatasetRef)>, Self::Error>> + Send + '_;

  // ── Outputs and metric values ─────────────────────────────────────────

  /// Record the output manifest of a successful execution. Every filename
  /// must be relative.
  fn record_outputs(
    &self,
    execution_id: i64,
    outputs: &[OutputRecord],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn record_scalar_values(
    &self,
    execution_id: i64,
    values: &[ScalarMetricValue],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn record_series_values(
    &self,
    execution_id: i64,
    values: &[SeriesMetricValue],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn list_outputs(
    &self,
    execution_id: i64,
  ) -> impl Future<Output = Result<Vec<OutputRecord>, Self::Error>> + Send + '_;

  // ── Coordination ──────────────────────────────────────────────────────

  /// Try to take the named advisory lock. Expired holders are evicted.
  fn try_acquire_lock(
    &self,
    name: &str,
    holder: &str,
    ttl: Duration,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn release_lock(
    &self,
    name: &str,
    holder: &str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Enqueue a work-queue message for an execution under a routing topic.
  fn enqueue_message(
    &self,
    topic: &str,
    execution_id: i64,
    payload: &str,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  /// Claim the oldest ready message whose delivery count is below
  /// `max_deliveries`; increments the delivery count.
  fn claim_message(
    &self,
    worker: &str,
    max_deliveries: u32,
  ) -> impl Future<Output = Result<Option<QueueMessage>, Self::Error>> + Send + '_;

  /// Remove a message after successful processing.
  fn complete_message(
    &self,
    message_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Return a claimed message to the ready state (transient failure;
  /// redelivery).
  fn release_message(
    &self,
    message_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
