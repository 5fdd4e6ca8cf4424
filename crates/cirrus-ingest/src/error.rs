//! Error type for `cirrus-ingest`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] cirrus_core::Error),

  #[error("invalid glob pattern {pattern:?}: {reason}")]
  InvalidPattern { pattern: String, reason: String },

  #[error("failed to parse {path}: {reason}")]
  Parse { path: PathBuf, reason: String },

  #[error("failed to build the extraction worker pool: {0}")]
  WorkerPool(String),

  #[error("not a netCDF classic file: {0}")]
  NotClassicNetcdf(PathBuf),

  #[error("malformed netCDF header in {path}: {reason}")]
  MalformedNetcdf { path: PathBuf, reason: String },

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
