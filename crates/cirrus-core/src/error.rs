//! Error types for `cirrus-core`.

use std::path::PathBuf;

use thiserror::Error;

use crate::dataset::SourceType;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid input: {0}")]
  InvalidInput(String),

  #[error("unknown source type: {0:?}")]
  UnknownSourceType(String),

  #[error("diagnostic {0:?} declares no data requirements")]
  NoDataRequirements(String),

  #[error("no data catalog available for source type {0}")]
  MissingCatalog(SourceType),

  #[error("unknown diagnostic {provider}/{diagnostic}")]
  UnknownDiagnostic {
    provider:   String,
    diagnostic: String,
  },

  #[error("invalid {bundle} bundle: {reason}")]
  BundleValidation { bundle: &'static str, reason: String },

  #[error("metric value facets do not match diagnostic declaration: {0}")]
  FacetMismatch(String),

  #[error("output path must be relative to the output directory: {0}")]
  AbsoluteOutputPath(PathBuf),

  #[error("diagnostic execution failed: {0}")]
  ExecutionFailed(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
