//! Error type for `cirrus-executor`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] cirrus_core::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("scheduler error: {0}")]
  Scheduler(String),

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  pub fn store<E: std::error::Error + Send + Sync + 'static>(e: E) -> Error {
    Error::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
