//! Recording the outcome of a diagnostic execution.
//!
//! On success the bundles are read back from the scratch directory, metric
//! values are validated against the diagnostic's declared facets, output
//! files are copied into the results root, and rows are written. Any
//! validation failure marks the execution failed with nothing recorded but
//! the log.

use std::path::{Path, PathBuf};

use cirrus_core::{
  cmec::{MetricBundle, OutputBundle, output::OutputSection},
  diagnostic::{EXECUTION_LOG_FILENAME, ExecutionResult},
  metrics::validate_facets,
  store::{EvaluationStore, ExecutionStatus, OutputRecord, OutputType},
};
use tracing::{info, warn};

use crate::{Error, ExecutionJob, ExecutorPaths, Result};

/// Record `result` for `job` and transition the execution to its terminal
/// state. The execution must be `running`.
pub async fn handle_execution_result<S: EvaluationStore>(
  store: &S,
  paths: &ExecutorPaths,
  job: &ExecutionJob,
  result: &ExecutionResult,
  failure_reason: Option<String>,
) -> Result<ExecutionStatus> {
  let execution_id = job.planned.execution_id;
  let definition = &job.planned.definition;
  let fragment = definition.output_fragment()?;

  // The captured log is copied whether or not the execution succeeded.
  if definition.log_path().exists() {
    copy_to_results(paths, &fragment, Path::new(EXECUTION_LOG_FILENAME))
      .await?;
  }

  if !result.successful {
    return fail(
      store,
      execution_id,
      failure_reason
        .unwrap_or_else(|| "diagnostic execution failed".to_string()),
    )
    .await;
  }

  let Some(metric_filename) = &result.metric_bundle_filename else {
    return fail(
      store,
      execution_id,
      "diagnostic produced no metric bundle".to_string(),
    )
    .await;
  };

  // Validate before recording anything: a bad bundle fails the execution
  // and inserts no values.
  let metric_bundle =
    match MetricBundle::read(&definition.output_path(metric_filename)) {
      Ok(bundle) => bundle,
      Err(e) => {
        return fail(
          store,
          execution_id,
          format!("unreadable metric bundle: {e}"),
        )
        .await;
      }
    };
  let scalar_values = match metric_bundle.iter_results() {
    Ok(values) => values,
    Err(e) => {
      return fail(store, execution_id, format!("invalid metric bundle: {e}"))
        .await;
    }
  };
  let declared = job.diagnostic.facets();
  for value in &scalar_values {
    if let Err(e) = validate_facets(&value.dimensions, declared) {
      return fail(store, execution_id, e.to_string()).await;
    }
  }
  for series in &result.series {
    if let Err(e) = series
      .validate()
      .and_then(|_| validate_facets(&series.dimensions, declared))
    {
      return fail(store, execution_id, e.to_string()).await;
    }
  }

  copy_to_results(paths, &fragment, metric_filename).await?;

  // The output bundle lists every file worth keeping; copy them across
  // and turn them into rows.
  let mut records: Vec<OutputRecord> = Vec::new();
  if let Some(output_filename) = &result.output_bundle_filename {
    let output_bundle =
      match OutputBundle::read(&definition.output_path(output_filename)) {
        Ok(bundle) => bundle,
        Err(e) => {
          return fail(
            store,
            execution_id,
            format!("unreadable output bundle: {e}"),
          )
          .await;
        }
      };
    copy_to_results(paths, &fragment, output_filename).await?;

    for (section, short_name, file) in output_bundle.files() {
      let relative = definition.as_relative_path(&file.filename)?;
      copy_to_results(paths, &fragment, &relative).await?;

      let output_type = OutputType::from_filename(&file.filename)
        .unwrap_or(default_type(section));
      records.push(OutputRecord {
        output_type,
        filename: relative.to_string_lossy().into_owned(),
        mime_type: output_type.mime_type().to_string(),
        short_name: short_name.to_string(),
        long_name: file.long_name.clone(),
        description: file.description.clone(),
      });
    }
  }

  store
    .record_outputs(execution_id, &records)
    .await
    .map_err(Error::store)?;
  store
    .record_scalar_values(execution_id, &scalar_values)
    .await
    .map_err(Error::store)?;
  store
    .record_series_values(execution_id, &result.series)
    .await
    .map_err(Error::store)?;

  // A successful run with the current dataset set makes the group clean.
  store
    .mark_group_clean(job.planned.group_id)
    .await
    .map_err(Error::store)?;

  store
    .transition_execution(
      execution_id,
      ExecutionStatus::Running,
      ExecutionStatus::Succeeded,
      None,
      None,
    )
    .await
    .map_err(Error::store)?;

  info!(
    execution_id,
    outputs = records.len(),
    values = scalar_values.len(),
    "execution succeeded"
  );
  Ok(ExecutionStatus::Succeeded)
}

fn default_type(section: OutputSection) -> OutputType {
  match section {
    OutputSection::Data => OutputType::NetCdf,
    OutputSection::Plots => OutputType::Png,
    OutputSection::Html => OutputType::Html,
    OutputSection::Metrics => OutputType::Json,
  }
}

async fn fail<S: EvaluationStore>(
  store: &S,
  execution_id: i64,
  reason: String,
) -> Result<ExecutionStatus> {
  warn!(execution_id, reason = %reason, "execution failed");
  store
    .transition_execution(
      execution_id,
      ExecutionStatus::Running,
      ExecutionStatus::Failed,
      Some(&reason),
      None,
    )
    .await
    .map_err(Error::store)?;
  Ok(ExecutionStatus::Failed)
}

/// Copy `<scratch>/<fragment>/<filename>` to
/// `<results>/<fragment>/<filename>`, creating parents.
///
/// Joining the stored relative path onto the results root at read time
/// reproduces exactly the path written here; results stay portable across
/// hosts with different mounts.
async fn copy_to_results(
  paths: &ExecutorPaths,
  fragment: &Path,
  filename: &Path,
) -> Result<PathBuf> {
  let source = paths.scratch_root.join(fragment).join(filename);
  let target = paths.results_root.join(fragment).join(filename);
  if let Some(parent) = target.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  tokio::fs::copy(&source, &target).await?;
  Ok(target)
}
