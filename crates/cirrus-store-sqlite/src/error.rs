//! Error type for `cirrus-store-sqlite`.

use std::path::PathBuf;

use cirrus_core::store::ExecutionStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] cirrus_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("group not found: {0}")]
  GroupNotFound(i64),

  /// The state machine forbids this transition outright; attempting it is a
  /// bug in the caller, not a lost race.
  #[error("illegal status transition {from} -> {to}")]
  IllegalTransition {
    from: ExecutionStatus,
    to:   ExecutionStatus,
  },

  /// An invariant the schema enforces was violated, e.g. a second running
  /// execution for one group. Always fatal.
  #[error("consistency failure: {0}")]
  Consistency(String),

  #[error("output file paths must be relative, got {0}")]
  AbsoluteOutputPath(PathBuf),

  #[error("database backup failed: {0}")]
  Backup(#[source] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
