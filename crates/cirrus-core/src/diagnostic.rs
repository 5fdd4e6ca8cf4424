//! The diagnostic contract: what a provider implements and what an
//! execution hands to it.

use std::{
  fs,
  io::Write as _,
  path::{Path, PathBuf},
  process::Command,
};

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  cmec::{
    METRIC_BUNDLE_FILENAME, MetricBundle, OUTPUT_BUNDLE_FILENAME,
    OutputBundle,
  },
  dataset::{ExecutionDatasets, GroupKey},
  metrics::SeriesMetricValue,
  requirement::DataRequirement,
};

/// Filename of the captured execution log within the output directory.
pub const EXECUTION_LOG_FILENAME: &str = "out.log";

/// Filename of the serialized definition handed to command-line
/// diagnostics.
pub const DEFINITION_FILENAME: &str = "definition.json";

// ─── Execution definition ────────────────────────────────────────────────────

/// Everything a diagnostic needs to perform one execution: the input
/// datasets and where to put its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDefinition {
  /// The group key identifying this execution's group.
  pub key:              GroupKey,
  pub datasets:         ExecutionDatasets,
  /// Absolute directory the diagnostic writes into; a subtree of
  /// `root_directory` owned exclusively by this execution.
  pub output_directory: PathBuf,
  /// The scratch root `output_directory` lives under.
  pub root_directory:   PathBuf,
}

impl ExecutionDefinition {
  /// Absolute path of a file in the output directory.
  pub fn output_path(&self, filename: impl AsRef<Path>) -> PathBuf {
    self.output_directory.join(filename)
  }

  pub fn log_path(&self) -> PathBuf {
    self.output_path(EXECUTION_LOG_FILENAME)
  }

  /// The output directory relative to the scratch root.
  pub fn output_fragment(&self) -> Result<PathBuf> {
    self
      .output_directory
      .strip_prefix(&self.root_directory)
      .map(Path::to_path_buf)
      .map_err(|_| {
        Error::InvalidInput(format!(
          "output directory {} is not under root {}",
          self.output_directory.display(),
          self.root_directory.display()
        ))
      })
  }

  /// Normalise a path to be relative to the output directory.
  ///
  /// Absolute paths under the output directory are stripped; absolute paths
  /// outside it are rejected.
  pub fn as_relative_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix(&self.output_directory) {
      return Ok(stripped.to_path_buf());
    }
    if path.is_absolute() {
      return Err(Error::AbsoluteOutputPath(path.to_path_buf()));
    }
    Ok(path.to_path_buf())
  }
}

// ─── Execution result ────────────────────────────────────────────────────────

/// What came out of running a diagnostic, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
  pub successful:             bool,
  /// Output bundle filename, relative to the output directory.
  pub output_bundle_filename: Option<PathBuf>,
  /// Metric bundle filename, relative to the output directory.
  pub metric_bundle_filename: Option<PathBuf>,
  /// Series values extracted by the diagnostic itself.
  #[serde(default)]
  pub series:                 Vec<SeriesMetricValue>,
}

impl ExecutionResult {
  /// Write both bundles into the output directory and return a successful
  /// result pointing at them.
  pub fn from_bundles(
    definition: &ExecutionDefinition,
    output_bundle: &OutputBundle,
    metric_bundle: &MetricBundle,
    series: Vec<SeriesMetricValue>,
  ) -> Result<ExecutionResult> {
    fs::create_dir_all(&definition.output_directory)?;
    output_bundle.write(&definition.output_path(OUTPUT_BUNDLE_FILENAME))?;
    metric_bundle.write(&definition.output_path(METRIC_BUNDLE_FILENAME))?;

    Ok(ExecutionResult {
      successful:             true,
      output_bundle_filename: Some(PathBuf::from(OUTPUT_BUNDLE_FILENAME)),
      metric_bundle_filename: Some(PathBuf::from(METRIC_BUNDLE_FILENAME)),
      series,
    })
  }

  pub fn from_failure() -> ExecutionResult {
    ExecutionResult {
      successful:             false,
      output_bundle_filename: None,
      metric_bundle_filename: None,
      series:                 Vec::new(),
    }
  }
}

/// A pending execution as planned by the solver: the persisted execution's
/// surrogate key plus everything an executor needs to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedExecution {
  pub execution_id:    i64,
  pub group_id:        i64,
  pub provider_slug:   String,
  pub diagnostic_slug: String,
  pub definition:      ExecutionDefinition,
}

// ─── Diagnostic trait ────────────────────────────────────────────────────────

/// A named unit of analysis declared by a provider.
///
/// `execute` does the work (writing files under the definition's output
/// directory); `build_execution_result` assembles the bundle pointers
/// afterwards. The two are split so subprocess-backed diagnostics can
/// produce their bundles out of process.
pub trait Diagnostic: Send + Sync {
  fn slug(&self) -> &str;

  fn data_requirements(&self) -> &[DataRequirement];

  /// Facet names this diagnostic emits on its metric values.
  fn facets(&self) -> &[String];

  fn execute(&self, definition: &ExecutionDefinition) -> Result<()>;

  fn build_execution_result(
    &self,
    definition: &ExecutionDefinition,
  ) -> Result<ExecutionResult>;
}

// ─── Command-line diagnostics ────────────────────────────────────────────────

/// A diagnostic backed by an external command.
///
/// The execution definition is serialized to `definition.json` in the
/// output directory and passed as the final argument; the command is
/// expected to leave `output.json` and `diagnostic.json` behind. Stdout and
/// stderr are appended to the execution log.
pub struct CommandLineDiagnostic {
  pub slug:              String,
  pub command:           Vec<String>,
  pub data_requirements: Vec<DataRequirement>,
  pub facets:            Vec<String>,
}

impl Diagnostic for CommandLineDiagnostic {
  fn slug(&self) -> &str {
    &self.slug
  }

  fn data_requirements(&self) -> &[DataRequirement] {
    &self.data_requirements
  }

  fn facets(&self) -> &[String] {
    &self.facets
  }

  fn execute(&self, definition: &ExecutionDefinition) -> Result<()> {
    let Some((program, args)) = self.command.split_first() else {
      return Err(Error::InvalidInput(format!(
        "diagnostic {:?} has an empty command",
        self.slug
      )));
    };

    fs::create_dir_all(&definition.output_directory)?;
    let definition_path = definition.output_path(DEFINITION_FILENAME);
    fs::write(&definition_path, serde_json::to_vec_pretty(definition)?)?;

    let output = Command::new(program)
      .args(args)
      .arg(&definition_path)
      .current_dir(&definition.output_directory)
      .output()
      .map_err(|e| {
        Error::ExecutionFailed(format!("failed to spawn {program:?}: {e}"))
      })?;

    let mut log = fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(definition.log_path())?;
    log.write_all(&output.stdout)?;
    log.write_all(&output.stderr)?;

    if !output.status.success() {
      return Err(Error::ExecutionFailed(format!(
        "{program:?} exited with {}",
        output.status
      )));
    }
    Ok(())
  }

  fn build_execution_result(
    &self,
    definition: &ExecutionDefinition,
  ) -> Result<ExecutionResult> {
    let output_path = definition.output_path(OUTPUT_BUNDLE_FILENAME);
    let metric_path = definition.output_path(METRIC_BUNDLE_FILENAME);
    if !output_path.exists() || !metric_path.exists() {
      return Err(Error::ExecutionFailed(format!(
        "diagnostic {:?} did not produce its bundles",
        self.slug
      )));
    }

    // Parse both to catch malformed bundles here rather than at recording
    // time.
    OutputBundle::read(&output_path)?;
    MetricBundle::read(&metric_path)?;

    Ok(ExecutionResult {
      successful:             true,
      output_bundle_filename: Some(PathBuf::from(OUTPUT_BUNDLE_FILENAME)),
      metric_bundle_filename: Some(PathBuf::from(METRIC_BUNDLE_FILENAME)),
      series:                 Vec::new(),
    })
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
