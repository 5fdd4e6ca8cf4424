//! Data requirements declared by diagnostics.

use serde::{Deserialize, Serialize};

use crate::{
  constraint::Constraint,
  dataset::{FacetFilter, SourceType},
};

/// A declarative description of the datasets a diagnostic consumes from one
/// source type: which entries to select, how to partition them into
/// execution groups, and what must hold within each group.
///
/// A diagnostic may declare several requirements; groups resolved for each
/// are combined as a cartesian product across source types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRequirement {
  pub source_type: SourceType,
  pub filters:     Vec<FacetFilter>,
  /// Facet names to partition on. `None` resolves to a single group holding
  /// every filtered entry.
  pub group_by:    Option<Vec<String>>,
  /// Applied to each group in declared order; a constraint may drop the
  /// group or augment it.
  pub constraints: Vec<Constraint>,
}

impl DataRequirement {
  pub fn new(source_type: SourceType) -> DataRequirement {
    DataRequirement {
      source_type,
      filters: Vec::new(),
      group_by: None,
      constraints: Vec::new(),
    }
  }

  pub fn with_filter(mut self, filter: FacetFilter) -> DataRequirement {
    self.filters.push(filter);
    self
  }

  pub fn with_group_by(
    mut self,
    facets: impl IntoIterator<Item = impl Into<String>>,
  ) -> DataRequirement {
    self.group_by = Some(facets.into_iter().map(Into::into).collect());
    self
  }

  pub fn with_constraint(mut self, constraint: Constraint) -> DataRequirement {
    self.constraints.push(constraint);
    self
  }
}
