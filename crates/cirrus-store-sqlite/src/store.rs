//! [`SqliteStore`] — the SQLite implementation of
//! [`EvaluationStore`](cirrus_core::store::EvaluationStore).

use std::{
  fs,
  future::Future,
  io,
  path::{Path, PathBuf},
  time::Duration,
};

use chrono::Utc;
use cirrus_core::{
  config::DbConfig,
  dataset::{DataCatalog, DatasetRef, GroupKey, SourceType},
  metrics::{ScalarMetricValue, SeriesMetricValue},
  store::{
    DiagnosticRow, EvaluationStore, ExecutionGroupRow, ExecutionRow,
    ExecutionStatus, GroupFilter, GroupWithLatest, NewDataset, NewExecution,
    OutputRecord, ProviderRow, QueueMessage,
  },
};
use rusqlite::OptionalExtension as _;
use tracing::{info, warn};

use crate::{
  Error, Result,
  encode::encode_dt,
  schema::{SCHEMA, SCHEMA_VERSION},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Cirrus evaluation store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted and all
/// access is serialized onto its worker thread.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    // The connection moves onto its own thread and needs an owned path.
    let conn =
      tokio_rusqlite::Connection::open(path.as_ref().to_path_buf()).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open a store from configuration: resolves the database URL, creates
  /// parent directories, and — when migrations are enabled and due — backs
  /// the file up first.
  pub async fn from_config(db: &DbConfig) -> Result<Self> {
    let Some(path) = db.sqlite_path() else {
      return Self::open_in_memory().await;
    };

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(Error::Backup)?;
    }

    if db.run_migrations {
      backup_before_migration(&path, db.max_backups)?;
      Self::open(&path).await
    } else {
      let conn = tokio_rusqlite::Connection::open(path).await?;
      Ok(Self { conn })
    }
  }

  pub(crate) fn conn(&self) -> &tokio_rusqlite::Connection {
    &self.conn
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Advisory locks ────────────────────────────────────────────────────────

  pub(crate) async fn try_acquire_lock_impl(
    &self,
    name: String,
    holder: String,
    ttl: Duration,
  ) -> Result<bool> {
    let now = Utc::now();
    let now_str = encode_dt(now);
    let expires = encode_dt(
      now
        + chrono::TimeDelta::from_std(ttl)
          .unwrap_or_else(|_| chrono::TimeDelta::seconds(60)),
    );

    let acquired = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        // Evict an expired holder before trying.
        tx.execute(
          "DELETE FROM advisory_lock WHERE name = ?1 AND expires_at < ?2",
          rusqlite::params![name, now_str],
        )?;

        let inserted = tx.execute(
          "INSERT OR IGNORE INTO advisory_lock
             (name, holder, acquired_at, expires_at)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![name, holder, now_str, expires],
        )?;

        let acquired = if inserted == 1 {
          true
        } else {
          // Re-entrant refresh for the current holder.
          tx.execute(
            "UPDATE advisory_lock SET expires_at = ?3
             WHERE name = ?1 AND holder = ?2",
            rusqlite::params![name, holder, expires],
          )? == 1
        };

        tx.commit()?;
        Ok(acquired)
      })
      .await?;
    Ok(acquired)
  }

  pub(crate) async fn release_lock_impl(
    &self,
    name: String,
    holder: String,
  ) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM advisory_lock WHERE name = ?1 AND holder = ?2",
          rusqlite::params![name, holder],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Work queue ────────────────────────────────────────────────────────────

  pub(crate) async fn enqueue_message_impl(
    &self,
    topic: String,
    execution_id: i64,
    payload: String,
  ) -> Result<i64> {
    let now = encode_dt(Utc::now());
    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO queue_message
             (topic, execution_id, payload, created_at)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![topic, execution_id, payload, now],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;
    Ok(id)
  }

  pub(crate) async fn claim_message_impl(
    &self,
    worker: String,
    max_deliveries: u32,
  ) -> Result<Option<QueueMessage>> {
    let now = encode_dt(Utc::now());
    let message = self
      .conn
      .call(move |conn| {
        let row = conn
          .query_row(
            "UPDATE queue_message
             SET state = 'claimed', claimed_by = ?1, claimed_at = ?2,
                 delivery_count = delivery_count + 1
             WHERE id = (
               SELECT id FROM queue_message
               WHERE state = 'ready' AND delivery_count < ?3
               ORDER BY id LIMIT 1)
             RETURNING id, topic, execution_id, payload, delivery_count",
            rusqlite::params![worker, now, max_deliveries],
            |row| {
              Ok(QueueMessage {
                id:             row.get(0)?,
                topic:          row.get(1)?,
                execution_id:   row.get(2)?,
                payload:        row.get(3)?,
                delivery_count: row.get::<_, i64>(4)? as u32,
              })
            },
          )
          .optional()?;
        Ok(row)
      })
      .await?;
    Ok(message)
  }

  pub(crate) async fn complete_message_impl(
    &self,
    message_id: i64,
  ) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM queue_message WHERE id = ?1",
          rusqlite::params![message_id],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub(crate) async fn release_message_impl(
    &self,
    message_id: i64,
  ) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE queue_message
           SET state = 'ready', claimed_by = NULL, claimed_at = NULL
           WHERE id = ?1",
          rusqlite::params![message_id],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Pre-migration backups ───────────────────────────────────────────────────

/// Copy a file-backed database aside before a schema migration touches it,
/// retaining the most recent `max_backups` copies.
fn backup_before_migration(path: &Path, max_backups: usize) -> Result<()> {
  if !path.exists() {
    return Ok(());
  }

  let current = read_user_version(path).map_err(|e| {
    Error::Consistency(format!(
      "cannot read schema version of {}: {e}",
      path.display()
    ))
  })?;
  if current == 0 || current == SCHEMA_VERSION {
    // Fresh database or already current; nothing to protect.
    return Ok(());
  }

  let stamp = Utc::now().format("%Y%m%dT%H%M%S");
  let backup = path.with_extension(format!("db.{stamp}.bak"));
  info!(
    from = %path.display(),
    to = %backup.display(),
    "backing up database before migration"
  );
  fs::copy(path, &backup).map_err(Error::Backup)?;

  if let Err(e) = prune_backups(path, max_backups) {
    warn!(error = %e, "failed to prune old database backups");
  }
  Ok(())
}

fn read_user_version(path: &Path) -> rusqlite::Result<i64> {
  let conn = rusqlite::Connection::open(path)?;
  conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

fn prune_backups(path: &Path, max_backups: usize) -> io::Result<()> {
  let Some(parent) = path.parent() else {
    return Ok(());
  };
  let stem = path
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_default();

  let mut backups: Vec<PathBuf> = fs::read_dir(parent)?
    .filter_map(|entry| entry.ok().map(|e| e.path()))
    .filter(|p| {
      let name = p.file_name().map(|n| n.to_string_lossy().into_owned());
      name.is_some_and(|n| n.starts_with(&stem) && n.ends_with(".bak"))
    })
    .collect();
  backups.sort();

  while backups.len() > max_backups {
    let oldest = backups.remove(0);
    fs::remove_file(oldest)?;
  }
  Ok(())
}

// ─── EvaluationStore impl ────────────────────────────────────────────────────

impl EvaluationStore for SqliteStore {
  type Error = Error;

  fn register_provider(
    &self,
    slug: &str,
    version: &str,
  ) -> impl Future<Output = Result<ProviderRow>> + Send + '_ {
    let slug = slug.to_owned();
    let version = version.to_owned();
    async move { self.register_provider_impl(slug, version).await }
  }

  fn register_diagnostic(
    &self,
    provider_id: i64,
    slug: &str,
  ) -> impl Future<Output = Result<DiagnosticRow>> + Send + '_ {
    let slug = slug.to_owned();
    async move { self.register_diagnostic_impl(provider_id, slug).await }
  }

  fn find_diagnostic(
    &self,
    provider_slug: &str,
    diagnostic_slug: &str,
  ) -> impl Future<Output = Result<Option<DiagnosticRow>>> + Send + '_ {
    let provider_slug = provider_slug.to_owned();
    let diagnostic_slug = diagnostic_slug.to_owned();
    async move {
      self.find_diagnostic_impl(provider_slug, diagnostic_slug).await
    }
  }

  fn flag_stale_groups(
    &self,
    registered: &[(String, String)],
  ) -> impl Future<Output = Result<u64>> + Send + '_ {
    let registered = registered.to_vec();
    async move { self.flag_stale_groups_impl(registered).await }
  }

  fn insert_dataset(
    &self,
    dataset: NewDataset,
  ) -> impl Future<Output = Result<(i64, bool)>> + Send + '_ {
    async move { self.insert_dataset_impl(dataset).await }
  }

  fn retract_dataset(
    &self,
    source_type: SourceType,
    instance_id: &str,
  ) -> impl Future<Output = Result<u64>> + Send + '_ {
    let instance_id = instance_id.to_owned();
    async move { self.retract_dataset_impl(source_type, instance_id).await }
  }

  fn load_catalog(
    &self,
    source_type: SourceType,
  ) -> impl Future<Output = Result<DataCatalog>> + Send + '_ {
    async move { self.load_catalog_impl(source_type).await }
  }

  fn ensure_group(
    &self,
    diagnostic_id: i64,
    key: &GroupKey,
  ) -> impl Future<Output = Result<(ExecutionGroupRow, bool)>> + Send + '_ {
    let key = key.clone();
    async move { self.ensure_group_impl(diagnostic_id, &key).await }
  }

  fn latest_execution(
    &self,
    group_id: i64,
  ) -> impl Future<Output = Result<Option<ExecutionRow>>> + Send + '_ {
    async move { self.latest_execution_impl(group_id).await }
  }

  fn find_execution(
    &self,
    group_id: i64,
    dataset_hash: &str,
  ) -> impl Future<Output = Result<Option<ExecutionRow>>> + Send + '_ {
    let dataset_hash = dataset_hash.to_owned();
    async move { self.find_execution_impl(group_id, dataset_hash).await }
  }

  fn mark_group_stale(
    &self,
    group_id: i64,
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    async move { self.mark_group_stale_impl(group_id).await }
  }

  fn mark_group_clean(
    &self,
    group_id: i64,
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    async move { self.set_group_dirty_impl(group_id, false).await }
  }

  fn mark_group_dirty(
    &self,
    group_id: i64,
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    async move { self.set_group_dirty_impl(group_id, true).await }
  }

  fn list_groups(
    &self,
    filter: &GroupFilter,
  ) -> impl Future<Output = Result<Vec<GroupWithLatest>>> + Send + '_ {
    let filter = filter.clone();
    async move { self.list_groups_impl(filter).await }
  }

  fn create_execution(
    &self,
    spec: NewExecution,
  ) -> impl Future<Output = Result<ExecutionRow>> + Send + '_ {
    async move { self.create_execution_impl(spec).await }
  }

  fn get_execution(
    &self,
    execution_id: i64,
  ) -> impl Future<Output = Result<Option<ExecutionRow>>> + Send + '_ {
    async move { self.get_execution_impl(execution_id).await }
  }

  fn transition_execution(
    &self,
    execution_id: i64,
    from: ExecutionStatus,
    to: ExecutionStatus,
    reason: Option<&str>,
    worker: Option<&str>,
  ) -> impl Future<Output = Result<bool>> + Send + '_ {
    let reason = reason.map(str::to_owned);
    let worker = worker.map(str::to_owned);
    async move {
      self
        .transition_execution_impl(execution_id, from, to, reason, worker)
        .await
    }
  }

  fn executions_with_status(
    &self,
    status: ExecutionStatus,
  ) -> impl Future<Output = Result<Vec<ExecutionRow>>> + Send + '_ {
    async move { self.executions_with_status_impl(status).await }
  }

  fn execution_inputs(
    &self,
    execution_id: i64,
  ) -> impl Future<Output = Result<Vec<(SourceType, DatasetRef)>>> + Send + '_
  {
    async move { self.execution_inputs_impl(execution_id).await }
  }

  fn record_outputs(
    &self,
    execution_id: i64,
    outputs: &[OutputRecord],
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    let outputs = outputs.to_vec();
    async move { self.record_outputs_impl(execution_id, outputs).await }
  }

  fn record_scalar_values(
    &self,
    execution_id: i64,
    values: &[ScalarMetricValue],
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    let values = values.to_vec();
    async move { self.record_scalar_values_impl(execution_id, values).await }
  }

  fn record_series_values(
    &self,
    execution_id: i64,
    values: &[SeriesMetricValue],
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    let values = values.to_vec();
    async move { self.record_series_values_impl(execution_id, values).await }
  }

  fn list_outputs(
    &self,
    execution_id: i64,
  ) -> impl Future<Output = Result<Vec<OutputRecord>>> + Send + '_ {
    async move { self.list_outputs_impl(execution_id).await }
  }

  fn try_acquire_lock(
    &self,
    name: &str,
    holder: &str,
    ttl: Duration,
  ) -> impl Future<Output = Result<bool>> + Send + '_ {
    let name = name.to_owned();
    let holder = holder.to_owned();
    async move { self.try_acquire_lock_impl(name, holder, ttl).await }
  }

  fn release_lock(
    &self,
    name: &str,
    holder: &str,
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    let name = name.to_owned();
    let holder = holder.to_owned();
    async move { self.release_lock_impl(name, holder).await }
  }

  fn enqueue_message(
    &self,
    topic: &str,
    execution_id: i64,
    payload: &str,
  ) -> impl Future<Output = Result<i64>> + Send + '_ {
    let topic = topic.to_owned();
    let payload = payload.to_owned();
    async move {
      self.enqueue_message_impl(topic, execution_id, payload).await
    }
  }

  fn claim_message(
    &self,
    worker: &str,
    max_deliveries: u32,
  ) -> impl Future<Output = Result<Option<QueueMessage>>> + Send + '_ {
    let worker = worker.to_owned();
    async move { self.claim_message_impl(worker, max_deliveries).await }
  }

  fn complete_message(
    &self,
    message_id: i64,
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    async move { self.complete_message_impl(message_id).await }
  }

  fn release_message(
    &self,
    message_id: i64,
  ) -> impl Future<Output = Result<()>> + Send + '_ {
    async move { self.release_message_impl(message_id).await }
  }
}
