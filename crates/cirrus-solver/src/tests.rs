//! End-to-end solver scenarios against an in-memory store.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use cirrus_core::{
  constraint::Constraint,
  dataset::{FacetFilter, SourceType, TimeRange},
  diagnostic::{Diagnostic, ExecutionDefinition, ExecutionResult},
  example::FileCountDiagnostic,
  provider::{DiagnosticProvider, ProviderRegistry},
  requirement::DataRequirement,
  store::{
    EvaluationStore, ExecutionStatus, GroupFilter, NewDataset, NewFile,
  },
};
use cirrus_store_sqlite::SqliteStore;

use crate::{SolveOptions, solve_required_executions};

// ─── Fixtures ────────────────────────────────────────────────────────────────

struct TestDiagnostic {
  slug:         &'static str,
  requirements: Vec<DataRequirement>,
  facets:       Vec<String>,
}

impl Diagnostic for TestDiagnostic {
  fn slug(&self) -> &str {
    self.slug
  }

  fn data_requirements(&self) -> &[DataRequirement] {
    &self.requirements
  }

  fn facets(&self) -> &[String] {
    &self.facets
  }

  fn execute(&self, _definition: &ExecutionDefinition) -> cirrus_core::Result<()> {
    Ok(())
  }

  fn build_execution_result(
    &self,
    _definition: &ExecutionDefinition,
  ) -> cirrus_core::Result<ExecutionResult> {
    Ok(ExecutionResult::from_failure())
  }
}

fn registry_with(diagnostic: impl Diagnostic + 'static) -> ProviderRegistry {
  ProviderRegistry::new(vec![
    DiagnosticProvider::new("example", "1.0.0")
      .register(Arc::new(diagnostic)),
  ])
}

fn example_registry(variable_id: &str) -> ProviderRegistry {
  ProviderRegistry::new(vec![
    DiagnosticProvider::new("example", "1.0.0")
      .register(Arc::new(FileCountDiagnostic::new(variable_id))),
  ])
}

fn cmip6_dataset(
  instance_suffix: &str,
  version: &str,
  facets: &[(&str, &str)],
  files: &[(&str, Option<(i32, i32)>)],
) -> NewDataset {
  NewDataset {
    source_type: SourceType::Cmip6,
    instance_id: format!("CMIP6.{instance_suffix}"),
    version:     version.to_string(),
    facets:      facets
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect(),
    files:       files
      .iter()
      .map(|(name, range)| NewFile {
        path:        format!("/data/{instance_suffix}/{version}/{name}")
          .into(),
        size:        100,
        checksum:    format!("sha-{name}"),
        variable_id: None,
        time_range:  range.map(|(start, end)| TimeRange {
          start: Utc.with_ymd_and_hms(start, 1, 1, 0, 0, 0).unwrap(),
          end:   Utc.with_ymd_and_hms(end, 1, 1, 0, 0, 0).unwrap(),
        }),
      })
      .collect(),
  }
}

fn access_facets<'a>(
  variable_id: &'a str,
  experiment_id: &'a str,
  member_id: &'a str,
) -> Vec<(&'a str, &'a str)> {
  vec![
    ("source_id", "ACCESS-ESM1-5"),
    ("experiment_id", experiment_id),
    ("variable_id", variable_id),
    ("member_id", member_id),
  ]
}

fn options(scratch: &tempfile::TempDir) -> SolveOptions {
  SolveOptions::new(scratch.path())
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

/// First solve creates one group with the expected canonical key and one
/// pending execution; a second solve with no catalog changes creates
/// nothing.
#[tokio::test]
async fn solve_is_idempotent() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let scratch = tempfile::tempdir().unwrap();
  store
    .insert_dataset(cmip6_dataset(
      "tas.r1",
      "v1",
      &access_facets("tas", "historical", "r1i1p1f1"),
      &[("f1.nc", None)],
    ))
    .await
    .unwrap();

  let registry = example_registry("tas");
  let outcome =
    solve_required_executions(&store, &registry, &options(&scratch))
      .await
      .unwrap();

  assert_eq!(outcome.summary.groups_created, 1);
  assert_eq!(outcome.summary.executions_created, 1);
  assert_eq!(outcome.planned.len(), 1);
  assert_eq!(
    outcome.planned[0].definition.key.canonical(),
    "experiment_id=historical,member_id=r1i1p1f1,\
     source_id=ACCESS-ESM1-5,variable_id=tas"
  );

  let execution = store
    .get_execution(outcome.planned[0].execution_id)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(execution.status, ExecutionStatus::Pending);

  let second =
    solve_required_executions(&store, &registry, &options(&scratch))
      .await
      .unwrap();
  assert_eq!(second.summary.groups_created, 0);
  assert_eq!(second.summary.executions_created, 0);
  assert!(second.planned.is_empty());
}

/// Grouping facets expand into one group per unique combination; datasets
/// excluded by the requirement filter produce nothing.
#[tokio::test]
async fn solve_expands_groups_per_facet_combination() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let scratch = tempfile::tempdir().unwrap();

  for (suffix, facets) in [
    ("ts.hist.r1", access_facets("ts", "historical", "r1i1p1f1")),
    ("ts.ssp119.r1", access_facets("ts", "ssp119", "r1i1p1f1")),
    ("ts.hist.r2", access_facets("ts", "historical", "r2i1p1f1")),
    ("pr.hist.r1", access_facets("pr", "historical", "r1i1p1f1")),
  ] {
    store
      .insert_dataset(cmip6_dataset(suffix, "v1", &facets, &[("f.nc", None)]))
      .await
      .unwrap();
  }

  let registry = example_registry("ts");
  let outcome =
    solve_required_executions(&store, &registry, &options(&scratch))
      .await
      .unwrap();

  assert_eq!(outcome.summary.groups_created, 3);
  assert_eq!(outcome.summary.executions_created, 3);
  assert!(
    outcome
      .planned
      .iter()
      .all(|p| p.definition.key.value("variable_id") == Some("ts"))
  );
}

/// Ingesting a newer version of a solved dataset makes the next solve
/// enqueue a new execution with a different dataset hash.
#[tokio::test]
async fn newer_version_triggers_new_execution() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let scratch = tempfile::tempdir().unwrap();
  store
    .insert_dataset(cmip6_dataset(
      "tas.r1",
      "v20200101",
      &access_facets("tas", "historical", "r1i1p1f1"),
      &[("f1.nc", None)],
    ))
    .await
    .unwrap();

  let registry = example_registry("tas");
  let first =
    solve_required_executions(&store, &registry, &options(&scratch))
      .await
      .unwrap();
  let first_execution = &first.planned[0];
  let first_hash = store
    .get_execution(first_execution.execution_id)
    .await
    .unwrap()
    .unwrap()
    .dataset_hash;

  // Run the first execution to completion.
  store
    .transition_execution(
      first_execution.execution_id,
      ExecutionStatus::Pending,
      ExecutionStatus::Running,
      None,
      Some("test-worker"),
    )
    .await
    .unwrap();
  store
    .transition_execution(
      first_execution.execution_id,
      ExecutionStatus::Running,
      ExecutionStatus::Succeeded,
      None,
      None,
    )
    .await
    .unwrap();
  store.mark_group_clean(first_execution.group_id).await.unwrap();

  // A newer version of the same instance arrives.
  store
    .insert_dataset(cmip6_dataset(
      "tas.r1",
      "v20210101",
      &access_facets("tas", "historical", "r1i1p1f1"),
      &[("f1.nc", None)],
    ))
    .await
    .unwrap();

  let second =
    solve_required_executions(&store, &registry, &options(&scratch))
      .await
      .unwrap();
  assert_eq!(second.summary.groups_created, 0);
  assert_eq!(second.summary.executions_created, 1);

  let second_hash = store
    .get_execution(second.planned[0].execution_id)
    .await
    .unwrap()
    .unwrap()
    .dataset_hash;
  assert_ne!(first_hash, second_hash);

  // The group was re-marked dirty when the new execution was enqueued.
  let groups = store.list_groups(&GroupFilter::default()).await.unwrap();
  assert!(groups[0].group.dirty);
}

/// A contiguity constraint drops groups whose file time ranges have gaps.
#[tokio::test]
async fn gapped_time_ranges_produce_no_executions() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let scratch = tempfile::tempdir().unwrap();
  store
    .insert_dataset(cmip6_dataset(
      "tas.r1",
      "v1",
      &access_facets("tas", "historical", "r1i1p1f1"),
      &[
        ("f1.nc", Some((1850, 1900))),
        ("f2.nc", Some((1950, 2000))),
      ],
    ))
    .await
    .unwrap();

  let registry = registry_with(TestDiagnostic {
    slug:         "contiguous-series",
    requirements: vec![
      DataRequirement::new(SourceType::Cmip6)
        .with_filter(FacetFilter::keep("variable_id", "tas"))
        .with_group_by(["source_id", "experiment_id", "variable_id"])
        .with_constraint(Constraint::RequireContiguousTimerange {
          group_by: vec!["instance_id".to_string()],
        }),
    ],
    facets:       vec![],
  });

  let outcome =
    solve_required_executions(&store, &registry, &options(&scratch))
      .await
      .unwrap();
  assert_eq!(outcome.summary.executions_created, 0);
  assert_eq!(outcome.summary.candidates, 0);
}

// ─── Flags and bookkeeping ───────────────────────────────────────────────────

#[tokio::test]
async fn dry_run_writes_nothing() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let scratch = tempfile::tempdir().unwrap();
  store
    .insert_dataset(cmip6_dataset(
      "tas.r1",
      "v1",
      &access_facets("tas", "historical", "r1i1p1f1"),
      &[("f1.nc", None)],
    ))
    .await
    .unwrap();

  let registry = example_registry("tas");
  let outcome = solve_required_executions(&store, &registry, &SolveOptions {
    dry_run: true,
    ..options(&scratch)
  })
  .await
  .unwrap();

  assert_eq!(outcome.summary.candidates, 1);
  assert_eq!(outcome.summary.executions_created, 0);
  assert!(
    store.list_groups(&GroupFilter::default()).await.unwrap().is_empty()
  );
}

#[tokio::test]
async fn provider_filter_restricts_solving() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let scratch = tempfile::tempdir().unwrap();
  store
    .insert_dataset(cmip6_dataset(
      "tas.r1",
      "v1",
      &access_facets("tas", "historical", "r1i1p1f1"),
      &[("f1.nc", None)],
    ))
    .await
    .unwrap();

  let registry = example_registry("tas");
  let outcome = solve_required_executions(&store, &registry, &SolveOptions {
    provider_filter: Some("nonexistent".to_string()),
    ..options(&scratch)
  })
  .await
  .unwrap();
  assert_eq!(outcome.summary.executions_created, 0);

  // Case-sensitive: "EXAMPLE" does not match "example".
  let outcome = solve_required_executions(&store, &registry, &SolveOptions {
    provider_filter: Some("EXAMPLE".to_string()),
    ..options(&scratch)
  })
  .await
  .unwrap();
  assert_eq!(outcome.summary.executions_created, 0);

  let outcome = solve_required_executions(&store, &registry, &SolveOptions {
    provider_filter: Some("exam".to_string()),
    ..options(&scratch)
  })
  .await
  .unwrap();
  assert_eq!(outcome.summary.executions_created, 1);
}

#[tokio::test]
async fn one_per_provider_caps_new_executions() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let scratch = tempfile::tempdir().unwrap();

  for (suffix, facets) in [
    ("ts.hist.r1", access_facets("ts", "historical", "r1i1p1f1")),
    ("ts.ssp119.r1", access_facets("ts", "ssp119", "r1i1p1f1")),
  ] {
    store
      .insert_dataset(cmip6_dataset(suffix, "v1", &facets, &[("f.nc", None)]))
      .await
      .unwrap();
  }

  let registry = example_registry("ts");
  let outcome = solve_required_executions(&store, &registry, &SolveOptions {
    one_per_provider: true,
    ..options(&scratch)
  })
  .await
  .unwrap();

  assert_eq!(outcome.summary.candidates, 2);
  assert_eq!(outcome.summary.executions_created, 1);
}

/// Withdrawing a dataset leaves its group flagged stale after the next
/// solve, but never deletes it.
#[tokio::test]
async fn vanished_candidates_flag_groups_stale() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let scratch = tempfile::tempdir().unwrap();
  store
    .insert_dataset(cmip6_dataset(
      "tas.r1",
      "v1",
      &access_facets("tas", "historical", "r1i1p1f1"),
      &[("f1.nc", None)],
    ))
    .await
    .unwrap();

  let registry = example_registry("tas");
  solve_required_executions(&store, &registry, &options(&scratch))
    .await
    .unwrap();

  store.retract_dataset(SourceType::Cmip6, "CMIP6.tas.r1").await.unwrap();

  let outcome =
    solve_required_executions(&store, &registry, &options(&scratch))
      .await
      .unwrap();
  assert_eq!(outcome.summary.groups_flagged_stale, 1);

  let groups = store.list_groups(&GroupFilter::default()).await.unwrap();
  assert_eq!(groups.len(), 1);
  assert!(groups[0].group.stale);
}

/// The planned execution's definition points into the scratch root using
/// the store's output fragment.
#[tokio::test]
async fn planned_definitions_point_into_scratch() {
  let store = SqliteStore::open_in_memory().await.unwrap();
  let scratch = tempfile::tempdir().unwrap();
  store
    .insert_dataset(cmip6_dataset(
      "tas.r1",
      "v1",
      &access_facets("tas", "historical", "r1i1p1f1"),
      &[("f1.nc", None)],
    ))
    .await
    .unwrap();

  let registry = example_registry("tas");
  let outcome =
    solve_required_executions(&store, &registry, &options(&scratch))
      .await
      .unwrap();

  let planned = &outcome.planned[0];
  let execution = store
    .get_execution(planned.execution_id)
    .await
    .unwrap()
    .unwrap();

  assert!(planned.definition.output_directory.starts_with(scratch.path()));
  assert!(
    planned
      .definition
      .output_directory
      .ends_with(&execution.output_fragment)
  );
  assert_eq!(
    planned.definition.output_fragment().unwrap().to_string_lossy(),
    execution.output_fragment
  );
}
