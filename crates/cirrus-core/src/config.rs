//! The immutable process configuration.
//!
//! Loaded once at startup (see the `cirrus` binary for discovery and
//! layering); every component receives it by reference. There are no
//! mutable configuration singletons.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logging verbosity; maps onto the tracing default directive.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Error,
  Warning,
  #[default]
  Info,
  Debug,
}

impl LogLevel {
  pub fn as_directive(&self) -> &'static str {
    match self {
      LogLevel::Error => "error",
      LogLevel::Warning => "warn",
      LogLevel::Info => "info",
      LogLevel::Debug => "debug",
    }
  }
}

/// Common absolute directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
  /// Log files from the orchestrator and executors.
  pub log:           PathBuf,
  /// Per-execution scratch space; intermediate output lands here before
  /// being copied to `results`.
  pub scratch:       PathBuf,
  /// Provider software environments.
  pub software:      PathBuf,
  /// Final results tree: `<provider>/<diagnostic>/<group>/<execution>/`.
  pub results:       PathBuf,
  /// Controlled vocabulary for metric-bundle dimensions; reserved for a
  /// strict checker.
  pub dimensions_cv: Option<PathBuf>,
}

impl PathsConfig {
  /// Defaults rooted under the configuration directory.
  pub fn under_root(root: &std::path::Path) -> PathsConfig {
    PathsConfig {
      log:           root.join("log"),
      scratch:       root.join("scratch"),
      software:      root.join("software"),
      results:       root.join("results"),
      dimensions_cv: None,
    }
  }
}

/// Datastore location and migration policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
  /// `sqlite:///absolute/path/to/cirrus.db` or `sqlite://:memory:`.
  pub database_url:   String,
  #[serde(default = "default_run_migrations")]
  pub run_migrations: bool,
  /// Pre-migration backups retained.
  #[serde(default = "default_max_backups")]
  pub max_backups:    usize,
}

fn default_run_migrations() -> bool {
  true
}

fn default_max_backups() -> usize {
  5
}

impl DbConfig {
  pub fn under_root(root: &std::path::Path) -> DbConfig {
    DbConfig {
      database_url:   format!(
        "sqlite://{}",
        root.join("db").join("cirrus.db").display()
      ),
      run_migrations: true,
      max_backups:    default_max_backups(),
    }
  }

  /// The filesystem path of a sqlite database URL, if file-backed.
  pub fn sqlite_path(&self) -> Option<PathBuf> {
    let rest = self.database_url.strip_prefix("sqlite://")?;
    if rest == ":memory:" {
      return None;
    }
    Some(PathBuf::from(rest))
  }
}

/// Which executor variant to run and its options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
  /// Fully-qualified variant name, e.g.
  /// `cirrus_executor.LocalPoolExecutor`.
  pub executor: String,
  /// Variant-specific options (pool size, scheduler parameters, ...).
  #[serde(default)]
  pub config:   BTreeMap<String, Value>,
}

impl Default for ExecutorConfig {
  fn default() -> ExecutorConfig {
    ExecutorConfig {
      executor: "cirrus_executor.LocalPoolExecutor".to_string(),
      config:   BTreeMap::new(),
    }
  }
}

/// One diagnostic-provider entry point and its options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
  /// Fully-qualified provider name, e.g. `cirrus_core.example`.
  pub provider: String,
  #[serde(default)]
  pub config:   BTreeMap<String, Value>,
}

/// The full configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub log_level:            LogLevel,
  pub paths:                PathsConfig,
  pub db:                   DbConfig,
  #[serde(default)]
  pub executor:             ExecutorConfig,
  #[serde(default)]
  pub diagnostic_providers: Vec<ProviderConfig>,
}

impl Config {
  /// Defaults for a configuration rooted at `root`.
  pub fn under_root(root: &std::path::Path) -> Config {
    Config {
      log_level:            LogLevel::default(),
      paths:                PathsConfig::under_root(root),
      db:                   DbConfig::under_root(root),
      executor:             ExecutorConfig::default(),
      diagnostic_providers: vec![ProviderConfig {
        provider: "cirrus_core.example".to_string(),
        config:   BTreeMap::new(),
      }],
    }
  }
}
