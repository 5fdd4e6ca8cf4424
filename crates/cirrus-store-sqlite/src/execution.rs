//! Execution groups, executions, outputs, and metric values.

use chrono::Utc;
use cirrus_core::{
  dataset::{DatasetRef, GroupKey, SourceType},
  metrics::{ScalarMetricValue, SeriesMetricValue},
  store::{
    ExecutionGroupRow, ExecutionRow, ExecutionStatus, GroupFilter,
    GroupWithLatest, NewExecution, OutputRecord,
  },
};
use rusqlite::OptionalExtension as _;
use std::path::Path;

use crate::{
  Error, Result,
  encode::{RawExecution, RawGroup, decode_source_type, encode_dt, encode_selectors},
  store::SqliteStore,
};

/// Map a unique-index violation on the one-running-per-group index to a
/// consistency failure; anything else passes through.
fn map_running_conflict(err: tokio_rusqlite::Error) -> Error {
  if err.to_string().contains("execution_one_running_idx") {
    return Error::Consistency(
      "a second execution attempted to enter 'running' for its group"
        .to_string(),
    );
  }
  Error::Database(err)
}

impl SqliteStore {
  // ── Execution groups ──────────────────────────────────────────────────────

  pub(crate) async fn ensure_group_impl(
    &self,
    diagnostic_id: i64,
    key: &GroupKey,
  ) -> Result<(ExecutionGroupRow, bool)> {
    let canonical = key.canonical();
    let selectors = encode_selectors(key)?;
    let now = encode_dt(Utc::now());

    let (raw, created) = self
      .conn()
      .call(move |conn| {
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
          .query_row(
            "SELECT id FROM execution_group
             WHERE diagnostic_id = ?1 AND group_key = ?2",
            rusqlite::params![diagnostic_id, canonical],
            |row| row.get(0),
          )
          .optional()?;

        let (id, created) = match existing {
          Some(id) => (id, false),
          None => {
            tx.execute(
              "INSERT INTO execution_group
                 (diagnostic_id, group_key, selectors, dirty,
                  created_at, updated_at)
               VALUES (?1, ?2, ?3, 1, ?4, ?4)",
              rusqlite::params![diagnostic_id, canonical, selectors, now],
            )?;
            (tx.last_insert_rowid(), true)
          }
        };

        let raw = tx.query_row(
          &format!(
            "SELECT {} FROM execution_group WHERE id = ?1",
            RawGroup::COLUMNS
          ),
          rusqlite::params![id],
          RawGroup::from_row,
        )?;
        tx.commit()?;
        Ok((raw, created))
      })
      .await?;

    Ok((raw.into_row()?, created))
  }

  pub(crate) async fn latest_execution_impl(
    &self,
    group_id: i64,
  ) -> Result<Option<ExecutionRow>> {
    let raw = self
      .conn()
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {} FROM execution WHERE group_id = ?1
                 ORDER BY id DESC LIMIT 1",
                RawExecution::COLUMNS
              ),
              rusqlite::params![group_id],
              RawExecution::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawExecution::into_row).transpose()
  }

  pub(crate) async fn find_execution_impl(
    &self,
    group_id: i64,
    dataset_hash: String,
  ) -> Result<Option<ExecutionRow>> {
    let raw = self
      .conn()
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {} FROM execution
                 WHERE group_id = ?1 AND dataset_hash = ?2",
                RawExecution::COLUMNS
              ),
              rusqlite::params![group_id, dataset_hash],
              RawExecution::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawExecution::into_row).transpose()
  }

  pub(crate) async fn mark_group_stale_impl(
    &self,
    group_id: i64,
  ) -> Result<()> {
    let now = encode_dt(Utc::now());
    let changed = self
      .conn()
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE execution_group SET stale = 1, updated_at = ?2
           WHERE id = ?1",
          rusqlite::params![group_id, now],
        )?)
      })
      .await?;
    if changed == 0 {
      return Err(Error::GroupNotFound(group_id));
    }
    Ok(())
  }

  pub(crate) async fn set_group_dirty_impl(
    &self,
    group_id: i64,
    dirty: bool,
  ) -> Result<()> {
    let now = encode_dt(Utc::now());
    let changed = self
      .conn()
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE execution_group SET dirty = ?2, updated_at = ?3
           WHERE id = ?1",
          rusqlite::params![group_id, dirty, now],
        )?)
      })
      .await?;
    if changed == 0 {
      return Err(Error::GroupNotFound(group_id));
    }
    Ok(())
  }

  pub(crate) async fn list_groups_impl(
    &self,
    filter: GroupFilter,
  ) -> Result<Vec<GroupWithLatest>> {
    struct RawListed {
      group:           RawGroup,
      provider_slug:   String,
      diagnostic_slug: String,
      latest:          Option<RawExecution>,
    }

    let raws = self
      .conn()
      .call(move |conn| {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(provider) = &filter.provider {
          params.push(Box::new(provider.clone()));
          conditions.push(format!("instr(p.slug, ?{}) > 0", params.len()));
        }
        if let Some(diagnostic) = &filter.diagnostic {
          params.push(Box::new(diagnostic.clone()));
          conditions.push(format!("instr(d.slug, ?{}) > 0", params.len()));
        }
        if let Some(dirty) = filter.dirty {
          params.push(Box::new(dirty));
          conditions.push(format!("g.dirty = ?{}", params.len()));
        }
        if let Some(successful) = filter.successful {
          if successful {
            conditions.push("le.status = 'succeeded'".to_string());
          } else {
            conditions
              .push("(le.id IS NULL OR le.status != 'succeeded')".to_string());
          }
        }

        let where_clause = if conditions.is_empty() {
          String::new()
        } else {
          format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
          "SELECT g.id, g.diagnostic_id, g.selectors, g.dirty, g.stale,
                  g.created_at, g.updated_at,
                  p.slug, d.slug,
                  le.id, le.group_id, le.dataset_hash, le.status, le.reason,
                  le.output_fragment, le.retry_count, le.worker,
                  le.started_at, le.finished_at, le.created_at
           FROM execution_group g
           JOIN diagnostic d ON d.id = g.diagnostic_id
           JOIN provider p ON p.id = d.provider_id
           LEFT JOIN execution le ON le.id = (
             SELECT id FROM execution e2 WHERE e2.group_id = g.id
             ORDER BY e2.id DESC LIMIT 1)
           {where_clause}
           ORDER BY g.id"
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| {
              let group = RawGroup {
                id:            row.get(0)?,
                diagnostic_id: row.get(1)?,
                selectors:     row.get(2)?,
                dirty:         row.get(3)?,
                stale:         row.get(4)?,
                created_at:    row.get(5)?,
                updated_at:    row.get(6)?,
              };
              let latest_id: Option<i64> = row.get(9)?;
              let latest = match latest_id {
                Some(id) => Some(RawExecution {
                  id,
                  group_id:        row.get(10)?,
                  dataset_hash:    row.get(11)?,
                  status:          row.get(12)?,
                  reason:          row.get(13)?,
                  output_fragment: row.get(14)?,
                  retry_count:     row.get(15)?,
                  worker:          row.get(16)?,
                  started_at:      row.get(17)?,
                  finished_at:     row.get(18)?,
                  created_at:      row.get(19)?,
                }),
                None => None,
              };
              Ok(RawListed {
                group,
                provider_slug: row.get(7)?,
                diagnostic_slug: row.get(8)?,
                latest,
              })
            },
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|raw| {
        Ok(GroupWithLatest {
          group:           raw.group.into_row()?,
          provider_slug:   raw.provider_slug,
          diagnostic_slug: raw.diagnostic_slug,
          latest:          raw.latest.map(RawExecution::into_row).transpose()?,
        })
      })
      .collect()
  }

  // ── Executions ────────────────────────────────────────────────────────────

  pub(crate) async fn create_execution_impl(
    &self,
    spec: NewExecution,
  ) -> Result<ExecutionRow> {
    let now = encode_dt(Utc::now());

    let raw = self
      .conn()
      .call(move |conn| {
        let tx = conn.transaction()?;

        tx.execute(
          "INSERT INTO execution
             (group_id, dataset_hash, status, output_fragment, created_at)
           VALUES (?1, ?2, 'pending', '', ?3)",
          rusqlite::params![spec.group_id, spec.dataset_hash, now],
        )?;
        let id = tx.last_insert_rowid();

        // The fragment embeds the execution id, which only exists now.
        let fragment = format!("{}/{id}", spec.fragment_prefix);
        tx.execute(
          "UPDATE execution SET output_fragment = ?2 WHERE id = ?1",
          rusqlite::params![id, fragment],
        )?;

        for (source_type, dataset) in &spec.inputs {
          tx.execute(
            "INSERT INTO execution_input
               (execution_id, dataset_id, source_type, instance_id, version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
              id,
              dataset.dataset_id,
              source_type.as_str(),
              dataset.instance_id,
              dataset.version
            ],
          )?;
        }

        let raw = tx.query_row(
          &format!(
            "SELECT {} FROM execution WHERE id = ?1",
            RawExecution::COLUMNS
          ),
          rusqlite::params![id],
          RawExecution::from_row,
        )?;
        tx.commit()?;
        Ok(raw)
      })
      .await?;

    raw.into_row()
  }

  pub(crate) async fn get_execution_impl(
    &self,
    execution_id: i64,
  ) -> Result<Option<ExecutionRow>> {
    let raw = self
      .conn()
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {} FROM execution WHERE id = ?1",
                RawExecution::COLUMNS
              ),
              rusqlite::params![execution_id],
              RawExecution::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawExecution::into_row).transpose()
  }

  /// Compare-and-set status transition; see the trait documentation.
  pub(crate) async fn transition_execution_impl(
    &self,
    execution_id: i64,
    from: ExecutionStatus,
    to: ExecutionStatus,
    reason: Option<String>,
    worker: Option<String>,
  ) -> Result<bool> {
    if !ExecutionStatus::can_transition(from, to) {
      return Err(Error::IllegalTransition { from, to });
    }
    let now = encode_dt(Utc::now());

    let changed = self
      .conn()
      .call(move |conn| {
        let changed = match to {
          ExecutionStatus::Running => conn.execute(
            "UPDATE execution
             SET status = 'running', worker = ?3, started_at = ?4,
                 reason = NULL, finished_at = NULL
             WHERE id = ?1 AND status = ?2",
            rusqlite::params![
              execution_id,
              from.as_str(),
              worker,
              now
            ],
          )?,
          // Retry: back to pending with a bumped retry count.
          ExecutionStatus::Pending => conn.execute(
            "UPDATE execution
             SET status = 'pending', retry_count = retry_count + 1,
                 reason = NULL, worker = NULL,
                 started_at = NULL, finished_at = NULL
             WHERE id = ?1 AND status = ?2",
            rusqlite::params![execution_id, from.as_str()],
          )?,
          _ => conn.execute(
            "UPDATE execution
             SET status = ?3, reason = ?4, finished_at = ?5
             WHERE id = ?1 AND status = ?2",
            rusqlite::params![
              execution_id,
              from.as_str(),
              to.as_str(),
              reason,
              now
            ],
          )?,
        };
        Ok(changed)
      })
      .await
      .map_err(map_running_conflict)?;

    Ok(changed == 1)
  }

  pub(crate) async fn executions_with_status_impl(
    &self,
    status: ExecutionStatus,
  ) -> Result<Vec<ExecutionRow>> {
    let raws = self
      .conn()
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM execution WHERE status = ?1 ORDER BY id",
          RawExecution::COLUMNS
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![status.as_str()],
            RawExecution::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawExecution::into_row).collect()
  }

  pub(crate) async fn execution_inputs_impl(
    &self,
    execution_id: i64,
  ) -> Result<Vec<(SourceType, DatasetRef)>> {
    let raws = self
      .conn()
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT source_type, dataset_id, instance_id, version
           FROM execution_input WHERE execution_id = ?1
           ORDER BY source_type, instance_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![execution_id], |row| {
            Ok((
              row.get::<_, String>(0)?,
              row.get::<_, i64>(1)?,
              row.get::<_, String>(2)?,
              row.get::<_, String>(3)?,
            ))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|(source_type, dataset_id, instance_id, version)| {
        Ok((
          decode_source_type(&source_type)?,
          DatasetRef { dataset_id, instance_id, version },
        ))
      })
      .collect()
  }

  // ── Outputs and metric values ─────────────────────────────────────────────

  pub(crate) async fn record_outputs_impl(
    &self,
    execution_id: i64,
    outputs: Vec<OutputRecord>,
  ) -> Result<()> {
    for output in &outputs {
      if Path::new(&output.filename).is_absolute() {
        return Err(Error::AbsoluteOutputPath(output.filename.clone().into()));
      }
    }

    self
      .conn()
      .call(move |conn| {
        let tx = conn.transaction()?;
        for output in &outputs {
          tx.execute(
            "INSERT INTO execution_output
               (execution_id, output_type, filename, mime_type,
                short_name, long_name, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
              execution_id,
              output.output_type.as_str(),
              output.filename,
              output.mime_type,
              output.short_name,
              output.long_name,
              output.description
            ],
          )?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub(crate) async fn list_outputs_impl(
    &self,
    execution_id: i64,
  ) -> Result<Vec<OutputRecord>> {
    let raws = self
      .conn()
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT output_type, filename, mime_type, short_name,
                  long_name, description
           FROM execution_output WHERE execution_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![execution_id], |row| {
            Ok(crate::encode::RawOutput {
              output_type: row.get(0)?,
              filename:    row.get(1)?,
              mime_type:   row.get(2)?,
              short_name:  row.get(3)?,
              long_name:   row.get(4)?,
              description: row.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(crate::encode::RawOutput::into_record).collect()
  }

  pub(crate) async fn record_scalar_values_impl(
    &self,
    execution_id: i64,
    values: Vec<ScalarMetricValue>,
  ) -> Result<()> {
    let encoded = values
      .iter()
      .map(|value| {
        Ok((
          value.value,
          serde_json::to_string(&value.dimensions)?,
          value
            .attributes
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        ))
      })
      .collect::<Result<Vec<_>>>()?;

    self
      .conn()
      .call(move |conn| {
        let tx = conn.transaction()?;
        for (value, dimensions, attributes) in &encoded {
          tx.execute(
            "INSERT INTO scalar_metric_value
               (execution_id, value, dimensions, attributes)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![execution_id, value, dimensions, attributes],
          )?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub(crate) async fn record_series_values_impl(
    &self,
    execution_id: i64,
    values: Vec<SeriesMetricValue>,
  ) -> Result<()> {
    let encoded = values
      .iter()
      .map(|series| {
        series.validate()?;
        Ok((
          serde_json::to_string(&series.values)?,
          serde_json::to_string(&series.index)?,
          series.index_name.clone(),
          serde_json::to_string(&series.dimensions)?,
          series
            .attributes
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        ))
      })
      .collect::<Result<Vec<_>>>()?;

    self
      .conn()
      .call(move |conn| {
        let tx = conn.transaction()?;
        for (vals, idx, index_name, dimensions, attributes) in &encoded {
          tx.execute(
            "INSERT INTO series_metric_value
               (execution_id, vals, idx, index_name, dimensions, attributes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
              execution_id,
              vals,
              idx,
              index_name,
              dimensions,
              attributes
            ],
          )?;
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
