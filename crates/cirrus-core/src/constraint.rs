//! Post-grouping constraints on candidate execution groups.
//!
//! A constraint takes a group of catalog entries and either returns an
//! (optionally augmented) group or drops it. Dropping is not an error; it is
//! logged at info level and the candidate simply does not become an
//! execution.

use std::collections::{BTreeMap, BTreeSet};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::{CatalogEntry, DataCatalog, TimeRange};

/// One kind per variant; applied in declared order via exhaustive dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
  /// Attach the single best-matching supplementary dataset (e.g. a cell
  /// measure such as `areacella`) to the group; drop the group if none
  /// exists.
  AddSupplementaryDataset(SupplementarySpec),
  /// Within each sub-grouping, the union of file time ranges must cover the
  /// min-to-max span without gaps.
  RequireContiguousTimerange { group_by: Vec<String> },
  /// Time ranges across the sub-groups must have a non-empty intersection.
  RequireOverlappingTimerange { group_by: Vec<String> },
  /// Attach all matching ancillary datasets without affecting grouping;
  /// never drops the group.
  SelectSupplementary(SupplementarySpec),
}

/// Template describing a supplementary dataset and how it must line up with
/// the group it is attached to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplementarySpec {
  /// Facets the supplementary dataset itself must carry
  /// (e.g. `variable_id = areacella`).
  pub supplementary_facets: BTreeMap<String, String>,
  /// Facets whose values must match values present in the group
  /// (e.g. `source_id`, `grid_label`).
  pub matching_facets:      Vec<String>,
}

impl Constraint {
  /// Apply the constraint. `None` means the group is dropped.
  pub fn apply(
    &self,
    group: Vec<CatalogEntry>,
    catalog: &DataCatalog,
  ) -> Option<Vec<CatalogEntry>> {
    match self {
      Constraint::AddSupplementaryDataset(spec) => {
        add_supplementary(spec, group, catalog)
      }
      Constraint::RequireContiguousTimerange { group_by } => {
        require_contiguous(group_by, group)
      }
      Constraint::RequireOverlappingTimerange { group_by } => {
        require_overlapping(group_by, group)
      }
      Constraint::SelectSupplementary(spec) => {
        Some(select_supplementary(spec, group, catalog))
      }
    }
  }
}

// ─── Supplementary datasets ──────────────────────────────────────────────────

/// Catalog entries matching `spec` against the values present in `group`,
/// grouped by instance id.
fn supplementary_candidates<'a>(
  spec: &SupplementarySpec,
  group: &[CatalogEntry],
  catalog: &'a DataCatalog,
) -> BTreeMap<&'a str, Vec<&'a CatalogEntry>> {
  // Values the group exhibits for each matching facet.
  let mut group_values: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
  for facet in &spec.matching_facets {
    let values = group
      .iter()
      .filter_map(|entry| entry.facet(facet))
      .collect::<BTreeSet<&str>>();
    group_values.insert(facet, values);
  }

  let mut candidates: BTreeMap<&str, Vec<&CatalogEntry>> = BTreeMap::new();
  'entry: for entry in &catalog.entries {
    for (facet, value) in &spec.supplementary_facets {
      if entry.facet(facet) != Some(value) {
        continue 'entry;
      }
    }
    for (facet, values) in &group_values {
      match entry.facet(facet) {
        Some(v) if values.contains(v) => {}
        _ => continue 'entry,
      }
    }
    candidates.entry(&entry.instance_id).or_default().push(entry);
  }
  candidates
}

fn add_supplementary(
  spec: &SupplementarySpec,
  mut group: Vec<CatalogEntry>,
  catalog: &DataCatalog,
) -> Option<Vec<CatalogEntry>> {
  let candidates = supplementary_candidates(spec, &group, catalog);

  // Prefer the latest version when several datasets match.
  let best = candidates
    .into_values()
    .max_by(|a, b| a[0].version.cmp(&b[0].version))?;
  if best.is_empty() {
    return None;
  }

  group.extend(best.into_iter().cloned());
  Some(group)
}

fn select_supplementary(
  spec: &SupplementarySpec,
  mut group: Vec<CatalogEntry>,
  catalog: &DataCatalog,
) -> Vec<CatalogEntry> {
  let candidates = supplementary_candidates(spec, &group, catalog);
  let known: BTreeSet<_> =
    group.iter().map(|entry| entry.path.clone()).collect();

  for entries in candidates.into_values() {
    for entry in entries {
      if !known.contains(&entry.path) {
        group.push(entry.clone());
      }
    }
  }
  group
}

// ─── Time-range constraints ──────────────────────────────────────────────────

/// Maximum allowed gap between consecutive files of one sub-group: the
/// longest month, plus an hour of slack for calendar rounding.
fn max_time_gap() -> TimeDelta {
  TimeDelta::days(31) + TimeDelta::hours(1)
}

/// Partition `group` by the values of `facets`, keeping only entries that
/// carry a time range.
fn timed_subgroups(
  facets: &[String],
  group: &[CatalogEntry],
) -> BTreeMap<Vec<String>, Vec<(TimeRange, CatalogEntry)>> {
  let mut subgroups: BTreeMap<Vec<String>, Vec<(TimeRange, CatalogEntry)>> =
    BTreeMap::new();

  'entry: for entry in group {
    let Some(range) = entry.time_range else {
      continue;
    };
    let mut key = Vec::with_capacity(facets.len());
    for facet in facets {
      match entry.facet(facet) {
        Some(v) => key.push(v.to_string()),
        None => continue 'entry,
      }
    }
    subgroups.entry(key).or_default().push((range, entry.clone()));
  }
  subgroups
}

fn require_contiguous(
  group_by: &[String],
  group: Vec<CatalogEntry>,
) -> Option<Vec<CatalogEntry>> {
  for (key, mut ranged) in timed_subgroups(group_by, &group) {
    if ranged.len() < 2 {
      continue;
    }
    ranged.sort_by_key(|(range, _)| range.start);

    for pair in ranged.windows(2) {
      let (prev, next) = (&pair[0], &pair[1]);
      if prev.0.gap_to(&next.0) > max_time_gap() {
        info!(
          instance_id = %next.1.instance_id,
          subgroup = %key.join("/"),
          after = %prev.1.path.display(),
          before = %next.1.path.display(),
          "dropping group: time range is not contiguous"
        );
        return None;
      }
    }
  }
  Some(group)
}

fn require_overlapping(
  group_by: &[String],
  group: Vec<CatalogEntry>,
) -> Option<Vec<CatalogEntry>> {
  let subgroups = timed_subgroups(group_by, &group);
  if subgroups.len() < 2 {
    return Some(group);
  }

  let latest_start = subgroups
    .values()
    .filter_map(|ranged| ranged.iter().map(|(r, _)| r.start).min())
    .max();
  let earliest_end = subgroups
    .values()
    .filter_map(|ranged| ranged.iter().map(|(r, _)| r.end).max())
    .min();

  match (latest_start, earliest_end) {
    (Some(start), Some(end)) if start >= end => {
      let instances = group
        .iter()
        .map(|entry| entry.instance_id.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(", ");
      info!(
        instances = %instances,
        "dropping group: no overlapping time range across sub-groups"
      );
      None
    }
    _ => Some(group),
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::dataset::SourceType;

  fn entry(
    instance_id: &str,
    version: &str,
    facets: &[(&str, &str)],
    range: Option<(i32, i32)>,
  ) -> CatalogEntry {
    CatalogEntry {
      dataset_id:  1,
      instance_id: instance_id.to_string(),
      version:     version.to_string(),
      path:        PathBuf::from(format!(
        "/data/{instance_id}-{}.nc",
        range.map(|(a, b)| format!("{a}-{b}")).unwrap_or_default()
      )),
      time_range:  range.map(|(start, end)| TimeRange {
        start: Utc.with_ymd_and_hms(start, 1, 1, 0, 0, 0).unwrap(),
        end:   Utc.with_ymd_and_hms(end, 1, 1, 0, 0, 0).unwrap(),
      }),
      facets:      facets
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
    }
  }

  fn instance_grouping() -> Vec<String> {
    vec!["instance_id".to_string()]
  }

  #[test]
  fn contiguous_accepts_touching_ranges() {
    let group = vec![
      entry("a", "v1", &[], Some((1850, 1900))),
      entry("a", "v1", &[], Some((1900, 1950))),
    ];
    let constraint = Constraint::RequireContiguousTimerange {
      group_by: instance_grouping(),
    };
    let catalog = DataCatalog::new(SourceType::Cmip6, vec![]);
    assert!(constraint.apply(group, &catalog).is_some());
  }

  #[test]
  fn contiguous_drops_gapped_ranges() {
    let group = vec![
      entry("a", "v1", &[], Some((1850, 1900))),
      entry("a", "v1", &[], Some((1950, 2000))),
    ];
    let constraint = Constraint::RequireContiguousTimerange {
      group_by: instance_grouping(),
    };
    let catalog = DataCatalog::new(SourceType::Cmip6, vec![]);
    assert!(constraint.apply(group, &catalog).is_none());
  }

  #[test]
  fn overlapping_requires_common_span() {
    let constraint = Constraint::RequireOverlappingTimerange {
      group_by: instance_grouping(),
    };
    let catalog = DataCatalog::new(SourceType::Cmip6, vec![]);

    let overlapping = vec![
      entry("a", "v1", &[], Some((1850, 1950))),
      entry("b", "v1", &[], Some((1900, 2000))),
    ];
    assert!(constraint.apply(overlapping, &catalog).is_some());

    let disjoint = vec![
      entry("a", "v1", &[], Some((1850, 1900))),
      entry("b", "v1", &[], Some((1950, 2000))),
    ];
    assert!(constraint.apply(disjoint, &catalog).is_none());
  }

  #[test]
  fn add_supplementary_attaches_latest_version() {
    let group =
      vec![entry("a", "v1", &[("source_id", "ACCESS"), ("variable_id", "tas")], None)];
    let catalog = DataCatalog::new(SourceType::Cmip6, vec![
      entry(
        "fx-old",
        "v20200101",
        &[("source_id", "ACCESS"), ("variable_id", "areacella")],
        None,
      ),
      entry(
        "fx-new",
        "v20210101",
        &[("source_id", "ACCESS"), ("variable_id", "areacella")],
        None,
      ),
    ]);

    let constraint =
      Constraint::AddSupplementaryDataset(SupplementarySpec {
        supplementary_facets: BTreeMap::from([(
          "variable_id".to_string(),
          "areacella".to_string(),
        )]),
        matching_facets:      vec!["source_id".to_string()],
      });

    let result = constraint.apply(group, &catalog).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[1].instance_id, "fx-new");
  }

  #[test]
  fn add_supplementary_drops_group_when_missing() {
    let group =
      vec![entry("a", "v1", &[("source_id", "ACCESS")], None)];
    let catalog = DataCatalog::new(SourceType::Cmip6, vec![entry(
      "fx",
      "v1",
      &[("source_id", "OTHER"), ("variable_id", "areacella")],
      None,
    )]);

    let constraint =
      Constraint::AddSupplementaryDataset(SupplementarySpec {
        supplementary_facets: BTreeMap::from([(
          "variable_id".to_string(),
          "areacella".to_string(),
        )]),
        matching_facets:      vec!["source_id".to_string()],
      });

    assert!(constraint.apply(group, &catalog).is_none());
  }

  #[test]
  fn select_supplementary_never_drops() {
    let group = vec![entry("a", "v1", &[("source_id", "ACCESS")], None)];
    let catalog = DataCatalog::new(SourceType::Cmip6, vec![]);

    let constraint = Constraint::SelectSupplementary(SupplementarySpec {
      supplementary_facets: BTreeMap::from([(
        "variable_id".to_string(),
        "sftlf".to_string(),
      )]),
      matching_facets:      vec!["source_id".to_string()],
    });

    let result = constraint.apply(group, &catalog).unwrap();
    assert_eq!(result.len(), 1);
  }
}
