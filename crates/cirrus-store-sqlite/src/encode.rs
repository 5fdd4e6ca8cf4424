//! Encoding and decoding helpers between Rust domain types and the
//! plain-text representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings. Structured fields (group
//! keys, metric dimensions, series payloads) are stored as compact JSON.

use chrono::{DateTime, Utc};
use cirrus_core::{
  dataset::{GroupKey, SourceType, TimeRange},
  store::{
    ExecutionGroupRow, ExecutionRow, ExecutionStatus, OutputRecord,
    OutputType,
  },
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339()
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn decode_dt_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  s.map(decode_dt).transpose()
}

// ─── Group keys ──────────────────────────────────────────────────────────────

/// Selectors are stored as a JSON array of `[facet, value]` pairs alongside
/// the canonical string used for uniqueness.
pub fn encode_selectors(key: &GroupKey) -> Result<String> {
  Ok(serde_json::to_string(key.pairs())?)
}

pub fn decode_selectors(s: &str) -> Result<GroupKey> {
  let pairs: Vec<(String, String)> = serde_json::from_str(s)?;
  Ok(GroupKey::new(pairs))
}

// ─── Enumerations ────────────────────────────────────────────────────────────

pub fn decode_source_type(s: &str) -> Result<SourceType> {
  Ok(SourceType::parse(s)?)
}

pub fn decode_status(s: &str) -> Result<ExecutionStatus> {
  ExecutionStatus::parse(s)
    .ok_or_else(|| Error::Consistency(format!("unknown status {s:?}")))
}

pub fn decode_output_type(s: &str) -> Result<OutputType> {
  OutputType::parse(s)
    .ok_or_else(|| Error::Consistency(format!("unknown output type {s:?}")))
}

// ─── Time ranges ─────────────────────────────────────────────────────────────

pub fn encode_time_range(
  range: Option<&TimeRange>,
) -> (Option<String>, Option<String>) {
  match range {
    Some(r) => (Some(encode_dt(r.start)), Some(encode_dt(r.end))),
    None => (None, None),
  }
}

pub fn decode_time_range(
  start: Option<&str>,
  end: Option<&str>,
) -> Result<Option<TimeRange>> {
  match (start, end) {
    (Some(start), Some(end)) => Ok(Some(TimeRange {
      start: decode_dt(start)?,
      end:   decode_dt(end)?,
    })),
    _ => Ok(None),
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw strings read directly from an `execution` row.
pub struct RawExecution {
  pub id:              i64,
  pub group_id:        i64,
  pub dataset_hash:    String,
  pub status:          String,
  pub reason:          Option<String>,
  pub output_fragment: String,
  pub retry_count:     i64,
  pub worker:          Option<String>,
  pub started_at:      Option<String>,
  pub finished_at:     Option<String>,
  pub created_at:      String,
}

impl RawExecution {
  /// Shared column list; keep in sync with [`RawExecution::from_row`].
  pub const COLUMNS: &'static str = "id, group_id, dataset_hash, status, \
     reason, output_fragment, retry_count, worker, started_at, finished_at, \
     created_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawExecution> {
    Ok(RawExecution {
      id:              row.get(0)?,
      group_id:        row.get(1)?,
      dataset_hash:    row.get(2)?,
      status:          row.get(3)?,
      reason:          row.get(4)?,
      output_fragment: row.get(5)?,
      retry_count:     row.get(6)?,
      worker:          row.get(7)?,
      started_at:      row.get(8)?,
      finished_at:     row.get(9)?,
      created_at:      row.get(10)?,
    })
  }

  pub fn into_row(self) -> Result<ExecutionRow> {
    Ok(ExecutionRow {
      id:              self.id,
      group_id:        self.group_id,
      dataset_hash:    self.dataset_hash,
      status:          decode_status(&self.status)?,
      reason:          self.reason,
      output_fragment: self.output_fragment,
      retry_count:     self.retry_count as u32,
      worker:          self.worker,
      started_at:      decode_dt_opt(self.started_at.as_deref())?,
      finished_at:     decode_dt_opt(self.finished_at.as_deref())?,
      created_at:      decode_dt(&self.created_at)?,
    })
  }
}

/// Raw strings read directly from an `execution_group` row.
pub struct RawGroup {
  pub id:            i64,
  pub diagnostic_id: i64,
  pub selectors:     String,
  pub dirty:         bool,
  pub stale:         bool,
  pub created_at:    String,
  pub updated_at:    String,
}

impl RawGroup {
  pub const COLUMNS: &'static str =
    "id, diagnostic_id, selectors, dirty, stale, created_at, updated_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawGroup> {
    Ok(RawGroup {
      id:            row.get(0)?,
      diagnostic_id: row.get(1)?,
      selectors:     row.get(2)?,
      dirty:         row.get(3)?,
      stale:         row.get(4)?,
      created_at:    row.get(5)?,
      updated_at:    row.get(6)?,
    })
  }

  pub fn into_row(self) -> Result<ExecutionGroupRow> {
    Ok(ExecutionGroupRow {
      id:            self.id,
      diagnostic_id: self.diagnostic_id,
      group_key:     decode_selectors(&self.selectors)?,
      dirty:         self.dirty,
      stale:         self.stale,
      created_at:    decode_dt(&self.created_at)?,
      updated_at:    decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw strings read directly from an `execution_output` row.
pub struct RawOutput {
  pub output_type: String,
  pub filename:    String,
  pub mime_type:   String,
  pub short_name:  String,
  pub long_name:   Option<String>,
  pub description: Option<String>,
}

impl RawOutput {
  pub fn into_record(self) -> Result<OutputRecord> {
    Ok(OutputRecord {
      output_type: decode_output_type(&self.output_type)?,
      filename:    self.filename,
      mime_type:   self.mime_type,
      short_name:  self.short_name,
      long_name:   self.long_name,
      description: self.description,
    })
  }
}
