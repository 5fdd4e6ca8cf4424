//! A minimal in-process provider, used for smoke tests and as the reference
//! implementation of the diagnostic contract.

use std::{fs, io::Write as _, sync::Arc};

use crate::{
  Result,
  cmec::{MetricBundle, OutputBundle, output::OutputFile},
  dataset::{FacetFilter, SourceType},
  diagnostic::{Diagnostic, ExecutionDefinition, ExecutionResult},
  metrics::ScalarMetricValue,
  provider::DiagnosticProvider,
  requirement::DataRequirement,
};

/// Counts the input files per dataset and reports them as a metric, one
/// execution per `(source_id, experiment_id, variable_id, member_id)`
/// combination.
pub struct FileCountDiagnostic {
  requirements: Vec<DataRequirement>,
  facets:       Vec<String>,
}

impl FileCountDiagnostic {
  pub fn new(variable_id: &str) -> FileCountDiagnostic {
    FileCountDiagnostic {
      requirements: vec![
        DataRequirement::new(SourceType::Cmip6)
          .with_filter(FacetFilter::keep("variable_id", variable_id))
          .with_group_by([
            "source_id",
            "experiment_id",
            "variable_id",
            "member_id",
          ]),
      ],
      facets:       vec!["region".to_string(), "metric".to_string()],
    }
  }
}

impl Diagnostic for FileCountDiagnostic {
  fn slug(&self) -> &str {
    "file-count"
  }

  fn data_requirements(&self) -> &[DataRequirement] {
    &self.requirements
  }

  fn facets(&self) -> &[String] {
    &self.facets
  }

  fn execute(&self, definition: &ExecutionDefinition) -> Result<()> {
    fs::create_dir_all(&definition.output_directory)?;

    // One CSV row per input file.
    fs::create_dir_all(definition.output_path("data"))?;
    let mut listing =
      fs::File::create(definition.output_path("data/inputs.csv"))?;
    writeln!(listing, "source_type,instance_id,path")?;
    for (source_type, collection) in &definition.datasets.by_source_type {
      for entry in &collection.entries {
        writeln!(
          listing,
          "{source_type},{},{}",
          entry.instance_id,
          entry.path.display()
        )?;
      }
    }
    Ok(())
  }

  fn build_execution_result(
    &self,
    definition: &ExecutionDefinition,
  ) -> Result<ExecutionResult> {
    let file_count: usize = definition
      .datasets
      .by_source_type
      .values()
      .map(|c| c.entries.len())
      .sum();

    let values = vec![ScalarMetricValue {
      dimensions: [
        ("region".to_string(), "global".to_string()),
        ("metric".to_string(), "file_count".to_string()),
      ]
      .into_iter()
      .collect(),
      value:      file_count as f64,
      attributes: None,
    }];
    let metric_bundle = MetricBundle::from_values(
      vec!["region".to_string(), "metric".to_string()],
      &values,
    )?;

    let mut output_bundle = OutputBundle::default();
    output_bundle.data.insert("inputs".to_string(), OutputFile {
      filename:    "data/inputs.csv".to_string(),
      description: Some("Input files used for this execution".to_string()),
      long_name:   None,
    });

    ExecutionResult::from_bundles(
      definition,
      &output_bundle,
      &metric_bundle,
      Vec::new(),
    )
  }
}

/// The built-in example provider: a single file-count diagnostic over
/// near-surface air temperature.
pub fn example_provider() -> DiagnosticProvider {
  DiagnosticProvider::new("example", "1.0.0")
    .register(Arc::new(FileCountDiagnostic::new("tas")))
}
