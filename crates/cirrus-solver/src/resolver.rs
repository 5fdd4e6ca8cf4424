//! The requirement resolver: from declared data requirements to concrete
//! execution candidates.

use std::collections::BTreeMap;

use cirrus_core::{
  Error as CoreError,
  dataset::{
    DataCatalog, DatasetCollection, ExecutionDatasets, GroupKey, SourceType,
  },
  diagnostic::Diagnostic,
  requirement::DataRequirement,
};
use tracing::debug;

use crate::Result;

/// A candidate execution: the complete input set for one group-key
/// combination that survived every constraint.
#[derive(Debug, Clone)]
pub struct ExecutionCandidate {
  pub datasets: ExecutionDatasets,
}

impl ExecutionCandidate {
  pub fn group_key(&self) -> GroupKey {
    self.datasets.group_key()
  }

  pub fn dataset_hash(&self) -> String {
    self.datasets.hash()
  }
}

/// Resolve one requirement against its catalog: filter, partition, apply
/// constraints in declared order.
pub fn resolve_requirement(
  catalog: &DataCatalog,
  requirement: &DataRequirement,
) -> Vec<DatasetCollection> {
  if catalog.is_empty() {
    debug!(
      source_type = %requirement.source_type,
      "no datasets in the catalog"
    );
    return Vec::new();
  }

  let subset = catalog.filter(&requirement.filters);
  if subset.is_empty() {
    debug!(
      source_type = %requirement.source_type,
      "no datasets survive the requirement filters"
    );
    return Vec::new();
  }

  let groups = match &requirement.group_by {
    Some(facets) => subset.group_by(facets),
    None => vec![(GroupKey::empty(), subset.entries.clone())],
  };

  let mut collections = Vec::new();
  'group: for (selector, mut entries) in groups {
    for constraint in &requirement.constraints {
      // Constraints see the full catalog so they can pull in datasets from
      // outside the group (supplementaries).
      match constraint.apply(entries, catalog) {
        Some(updated) => entries = updated,
        None => {
          debug!(selector = %selector, "group dropped by constraint");
          continue 'group;
        }
      }
    }
    collections.push(DatasetCollection { selector, entries });
  }
  collections
}

/// Resolve every requirement of a diagnostic and combine the surviving
/// groups as a cartesian product across source types.
pub fn resolve_diagnostic(
  catalogs: &BTreeMap<SourceType, DataCatalog>,
  diagnostic: &dyn Diagnostic,
) -> Result<Vec<ExecutionCandidate>> {
  let requirements = diagnostic.data_requirements();
  if requirements.is_empty() {
    return Err(
      CoreError::NoDataRequirements(diagnostic.slug().to_string()).into(),
    );
  }

  // Later requirements for the same source type replace earlier ones.
  let mut groups_by_source: BTreeMap<SourceType, Vec<DatasetCollection>> =
    BTreeMap::new();
  for requirement in requirements {
    let catalog = catalogs
      .get(&requirement.source_type)
      .ok_or(CoreError::MissingCatalog(requirement.source_type))?;
    groups_by_source
      .insert(requirement.source_type, resolve_requirement(catalog, requirement));
  }

  // Cartesian product across source types; any empty side produces no
  // candidates.
  let source_types: Vec<SourceType> =
    groups_by_source.keys().copied().collect();
  let mut candidates = vec![BTreeMap::<SourceType, DatasetCollection>::new()];
  for source_type in &source_types {
    let collections = &groups_by_source[source_type];
    let mut next = Vec::with_capacity(candidates.len() * collections.len());
    for partial in &candidates {
      for collection in collections {
        let mut extended = partial.clone();
        extended.insert(*source_type, collection.clone());
        next.push(extended);
      }
    }
    candidates = next;
  }

  Ok(
    candidates
      .into_iter()
      .filter(|by_source| !by_source.is_empty())
      .map(|by_source| ExecutionCandidate {
        datasets: ExecutionDatasets::new(by_source),
      })
      .collect(),
  )
}
