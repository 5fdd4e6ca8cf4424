//! Datasets, facets, and the in-memory data catalog.
//!
//! The catalog is a flat table of file-level entries. Each entry carries the
//! facets of its owning dataset, so the resolver can filter and group without
//! touching the database again.

use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
  path::PathBuf,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

// ─── Source types ────────────────────────────────────────────────────────────

/// Types of supported source datasets.
///
/// Iteration order everywhere in the crate is alphabetical on the string
/// value; group keys and dataset hashes depend on it.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
  Cmip6,
  Obs4mips,
  PmpClimatology,
}

impl SourceType {
  /// All source types, ordered alphabetically by their string value.
  pub fn ordered() -> &'static [SourceType] {
    &[SourceType::Cmip6, SourceType::Obs4mips, SourceType::PmpClimatology]
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      SourceType::Cmip6 => "cmip6",
      SourceType::Obs4mips => "obs4mips",
      SourceType::PmpClimatology => "pmp-climatology",
    }
  }

  pub fn parse(s: &str) -> Result<SourceType> {
    match s {
      "cmip6" => Ok(SourceType::Cmip6),
      "obs4mips" => Ok(SourceType::Obs4mips),
      "pmp-climatology" => Ok(SourceType::PmpClimatology),
      other => Err(Error::UnknownSourceType(other.to_string())),
    }
  }
}

impl fmt::Display for SourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ─── Time ranges ─────────────────────────────────────────────────────────────

/// Half-open interval `[start, end)` covered by a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
  pub start: DateTime<Utc>,
  pub end:   DateTime<Utc>,
}

impl TimeRange {
  pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<TimeRange> {
    if end <= start {
      return Err(Error::InvalidInput(format!(
        "time range end {end} is not after start {start}"
      )));
    }
    Ok(TimeRange { start, end })
  }

  /// Gap between the end of `self` and the start of `next`. Negative when the
  /// ranges overlap.
  pub fn gap_to(&self, next: &TimeRange) -> TimeDelta {
    next.start - self.end
  }

  pub fn overlaps(&self, other: &TimeRange) -> bool {
    self.start < other.end && other.start < self.end
  }
}

// ─── Facet filters ───────────────────────────────────────────────────────────

/// A filter over catalog entries.
///
/// With `keep = true` an entry survives only if, for every facet, its value
/// is one of the listed values. With `keep = false` an entry is removed only
/// if *all* facets match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetFilter {
  pub facets: BTreeMap<String, Vec<String>>,
  #[serde(default = "default_keep")]
  pub keep:   bool,
}

fn default_keep() -> bool {
  true
}

impl FacetFilter {
  /// Keep entries whose `facet` equals `value`.
  pub fn keep(facet: &str, value: &str) -> FacetFilter {
    FacetFilter {
      facets: BTreeMap::from([(facet.to_string(), vec![value.to_string()])]),
      keep:   true,
    }
  }

  /// Remove entries matching all of `facets`.
  pub fn remove(facets: BTreeMap<String, Vec<String>>) -> FacetFilter {
    FacetFilter { facets, keep: false }
  }

  fn matches_all(&self, entry: &CatalogEntry) -> bool {
    self.facets.iter().all(|(facet, values)| {
      entry
        .facet(facet)
        .is_some_and(|v| values.iter().any(|candidate| candidate == v))
    })
  }

  /// Whether `entry` survives this filter.
  pub fn retains(&self, entry: &CatalogEntry) -> bool {
    if self.keep {
      self.matches_all(entry)
    } else {
      !self.matches_all(entry)
    }
  }
}

// ─── Catalog entries ─────────────────────────────────────────────────────────

/// One file of an active dataset, with the owning dataset's facets attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
  pub dataset_id:  i64,
  pub instance_id: String,
  pub version:     String,
  pub path:        PathBuf,
  pub time_range:  Option<TimeRange>,
  pub facets:      BTreeMap<String, String>,
}

impl CatalogEntry {
  /// Look up a facet value; `instance_id` and `version` resolve to the
  /// dedicated fields so they can be used in filters and group-bys.
  pub fn facet(&self, name: &str) -> Option<&str> {
    match name {
      "instance_id" => Some(&self.instance_id),
      "version" => Some(&self.version),
      _ => self.facets.get(name).map(String::as_str),
    }
  }

  pub fn dataset_ref(&self) -> DatasetRef {
    DatasetRef {
      dataset_id:  self.dataset_id,
      instance_id: self.instance_id.clone(),
      version:     self.version.clone(),
    }
  }
}

/// A `(dataset, version)` reference as recorded on an execution input.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DatasetRef {
  pub dataset_id:  i64,
  pub instance_id: String,
  pub version:     String,
}

// ─── Data catalog ────────────────────────────────────────────────────────────

/// The active view of one source type: file-level entries for the latest,
/// non-retracted version of each dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCatalog {
  pub source_type: SourceType,
  pub entries:     Vec<CatalogEntry>,
}

impl DataCatalog {
  pub fn new(source_type: SourceType, entries: Vec<CatalogEntry>) -> Self {
    DataCatalog { source_type, entries }
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Apply filters: the conjunction of all `keep` filters, minus anything a
  /// `remove` filter matches.
  pub fn filter(&self, filters: &[FacetFilter]) -> DataCatalog {
    let entries = self
      .entries
      .iter()
      .filter(|entry| filters.iter().all(|f| f.retains(entry)))
      .cloned()
      .collect();
    DataCatalog { source_type: self.source_type, entries }
  }

  /// Partition entries by their values on `facets`.
  ///
  /// Entries missing one of the facets are skipped. Groups are returned in
  /// sorted order of their key so downstream iteration is deterministic.
  pub fn group_by(
    &self,
    facets: &[String],
  ) -> Vec<(GroupKey, Vec<CatalogEntry>)> {
    let mut groups: BTreeMap<Vec<String>, Vec<CatalogEntry>> = BTreeMap::new();

    'entry: for entry in &self.entries {
      let mut values = Vec::with_capacity(facets.len());
      for facet in facets {
        match entry.facet(facet) {
          Some(v) => values.push(v.to_string()),
          None => continue 'entry,
        }
      }
      groups.entry(values).or_default().push(entry.clone());
    }

    groups
      .into_iter()
      .map(|(values, entries)| {
        let pairs = facets
          .iter()
          .cloned()
          .zip(values)
          .collect::<Vec<(String, String)>>();
        (GroupKey::new(pairs), entries)
      })
      .collect()
  }

  /// Deduplicated projection over the catalog's datasets.
  ///
  /// Each returned row holds the values of `columns` for one active dataset
  /// (empty string when a facet is absent); duplicate rows are collapsed.
  pub fn project(&self, columns: &[String], limit: usize) -> Vec<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut rows = Vec::new();

    for entry in &self.entries {
      let row: Vec<String> = columns
        .iter()
        .map(|c| entry.facet(c).unwrap_or_default().to_string())
        .collect();
      if seen.insert(row.clone()) {
        rows.push(row);
        if rows.len() == limit {
          break;
        }
      }
    }
    rows
  }
}

// ─── Group keys ──────────────────────────────────────────────────────────────

/// The stable identity of an execution group: `(facet, value)` pairs sorted
/// by facet name.
///
/// Two resolver runs over the same data must produce byte-identical
/// canonical forms regardless of dataset insertion order.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GroupKey(Vec<(String, String)>);

impl GroupKey {
  pub fn new(mut pairs: Vec<(String, String)>) -> GroupKey {
    pairs.sort();
    pairs.dedup();
    GroupKey(pairs)
  }

  pub fn empty() -> GroupKey {
    GroupKey(Vec::new())
  }

  pub fn pairs(&self) -> &[(String, String)] {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Value for `facet`, if the key contains it.
  pub fn value(&self, facet: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(name, _)| name == facet)
      .map(|(_, value)| value.as_str())
  }

  /// Merge pairs from another key, keeping the sorted/deduplicated form.
  pub fn merge(&self, other: &GroupKey) -> GroupKey {
    let mut pairs = self.0.clone();
    pairs.extend(other.0.iter().cloned());
    GroupKey::new(pairs)
  }

  /// Canonical string form: `facet=value` pairs joined with `,`.
  pub fn canonical(&self) -> String {
    self
      .0
      .iter()
      .map(|(facet, value)| format!("{facet}={value}"))
      .collect::<Vec<_>>()
      .join(",")
  }

  /// Filesystem-safe form of [`GroupKey::canonical`]: every byte outside
  /// `[A-Za-z0-9_.-]` becomes `_`.
  pub fn slug(&self) -> String {
    self
      .canonical()
      .chars()
      .map(|c| {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
          c
        } else {
          '_'
        }
      })
      .collect()
  }
}

impl fmt::Display for GroupKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical())
  }
}

// ─── Execution input collections ─────────────────────────────────────────────

/// The datasets of one source type selected for a candidate execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetCollection {
  /// The `(facet, value)` pairs selected during the group-by.
  pub selector: GroupKey,
  pub entries:  Vec<CatalogEntry>,
}

impl DatasetCollection {
  /// Distinct datasets in this collection, sorted by instance id.
  pub fn datasets(&self) -> Vec<DatasetRef> {
    let mut refs: Vec<DatasetRef> =
      self.entries.iter().map(CatalogEntry::dataset_ref).collect();
    refs.sort();
    refs.dedup();
    refs
  }
}

/// The complete input set of a candidate execution, across source types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDatasets {
  pub by_source_type: BTreeMap<SourceType, DatasetCollection>,
}

impl ExecutionDatasets {
  pub fn new(
    by_source_type: BTreeMap<SourceType, DatasetCollection>,
  ) -> ExecutionDatasets {
    ExecutionDatasets { by_source_type }
  }

  pub fn get(&self, source_type: SourceType) -> Option<&DatasetCollection> {
    self.by_source_type.get(&source_type)
  }

  /// The group key: the union of selectors across source types.
  ///
  /// Pairs sort by facet name first; equal pairs coming from different
  /// source types collapse to one.
  pub fn group_key(&self) -> GroupKey {
    let mut key = GroupKey::empty();
    for collection in self.by_source_type.values() {
      key = key.merge(&collection.selector);
    }
    key
  }

  /// Distinct datasets across all source types.
  pub fn dataset_refs(&self) -> Vec<(SourceType, DatasetRef)> {
    let mut refs = Vec::new();
    for (source_type, collection) in &self.by_source_type {
      for r in collection.datasets() {
        refs.push((*source_type, r));
      }
    }
    refs
  }

  /// SHA-256 over the canonical byte string
  /// `"{source_type}\t{instance_id}\t{version}\n"` for every input dataset,
  /// concatenated sorted by `(source_type, instance_id)`.
  ///
  /// This form is a contract: hashes must be identical across processes and
  /// insertion orders.
  pub fn hash(&self) -> String {
    let mut lines: Vec<String> = self
      .dataset_refs()
      .into_iter()
      .map(|(source_type, r)| {
        format!("{}\t{}\t{}\n", source_type, r.instance_id, r.version)
      })
      .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
      hasher.update(line.as_bytes());
    }
    format!("{:x}", hasher.finalize())
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  fn entry(
    dataset_id: i64,
    instance_id: &str,
    version: &str,
    facets: &[(&str, &str)],
  ) -> CatalogEntry {
    CatalogEntry {
      dataset_id,
      instance_id: instance_id.to_string(),
      version: version.to_string(),
      path: PathBuf::from(format!("/data/{instance_id}.nc")),
      time_range: None,
      facets: facets
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
    }
  }

  fn collection(
    selector: &[(&str, &str)],
    entries: Vec<CatalogEntry>,
  ) -> DatasetCollection {
    DatasetCollection {
      selector: GroupKey::new(
        selector
          .iter()
          .map(|(k, v)| (k.to_string(), v.to_string()))
          .collect(),
      ),
      entries,
    }
  }

  #[test]
  fn source_type_ordering_is_alphabetical() {
    let values: Vec<&str> =
      SourceType::ordered().iter().map(|s| s.as_str()).collect();
    let mut sorted = values.clone();
    sorted.sort();
    assert_eq!(values, sorted);
  }

  #[test]
  fn keep_filter_requires_all_facets() {
    let e = entry(1, "a", "v1", &[("variable_id", "tas"), ("grid", "gn")]);
    assert!(FacetFilter::keep("variable_id", "tas").retains(&e));
    assert!(!FacetFilter::keep("variable_id", "pr").retains(&e));
    // A missing facet never matches a keep filter.
    assert!(!FacetFilter::keep("experiment_id", "historical").retains(&e));
  }

  #[test]
  fn remove_filter_excludes_only_full_matches() {
    let e = entry(1, "a", "v1", &[("variable_id", "tas"), ("grid", "gn")]);
    let full = FacetFilter::remove(BTreeMap::from([
      ("variable_id".to_string(), vec!["tas".to_string()]),
      ("grid".to_string(), vec!["gn".to_string()]),
    ]));
    let partial = FacetFilter::remove(BTreeMap::from([
      ("variable_id".to_string(), vec!["tas".to_string()]),
      ("grid".to_string(), vec!["gr".to_string()]),
    ]));
    assert!(!full.retains(&e));
    assert!(partial.retains(&e));
  }

  #[test]
  fn group_by_partitions_and_sorts() {
    let catalog = DataCatalog::new(SourceType::Cmip6, vec![
      entry(1, "b", "v1", &[("variable_id", "ts")]),
      entry(2, "a", "v1", &[("variable_id", "pr")]),
      entry(3, "c", "v1", &[("variable_id", "ts")]),
    ]);
    let groups = catalog.group_by(&["variable_id".to_string()]);
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].0.canonical(), "variable_id=pr");
    assert_eq!(groups[1].0.canonical(), "variable_id=ts");
    assert_eq!(groups[1].1.len(), 2);
  }

  #[test]
  fn group_by_skips_entries_missing_a_facet() {
    let catalog = DataCatalog::new(SourceType::Cmip6, vec![
      entry(1, "a", "v1", &[("variable_id", "ts")]),
      entry(2, "b", "v1", &[]),
    ]);
    let groups = catalog.group_by(&["variable_id".to_string()]);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].1.len(), 1);
  }

  #[test]
  fn group_key_canonical_is_sorted_by_facet() {
    let key = GroupKey::new(vec![
      ("variable_id".to_string(), "tas".to_string()),
      ("experiment_id".to_string(), "historical".to_string()),
      ("source_id".to_string(), "ACCESS-ESM1-5".to_string()),
      ("member_id".to_string(), "r1i1p1f1".to_string()),
    ]);
    assert_eq!(
      key.canonical(),
      "experiment_id=historical,member_id=r1i1p1f1,\
       source_id=ACCESS-ESM1-5,variable_id=tas"
    );
  }

  #[test]
  fn dataset_hash_is_stable_under_insertion_order() {
    let a = ExecutionDatasets::new(BTreeMap::from([(
      SourceType::Cmip6,
      collection(&[("variable_id", "tas")], vec![
        entry(1, "ds-a", "v1", &[]),
        entry(2, "ds-b", "v2", &[]),
      ]),
    )]));
    let b = ExecutionDatasets::new(BTreeMap::from([(
      SourceType::Cmip6,
      collection(&[("variable_id", "tas")], vec![
        entry(2, "ds-b", "v2", &[]),
        entry(1, "ds-a", "v1", &[]),
      ]),
    )]));
    assert_eq!(a.hash(), b.hash());
  }

  #[test]
  fn dataset_hash_matches_canonical_form() {
    let datasets = ExecutionDatasets::new(BTreeMap::from([(
      SourceType::Cmip6,
      collection(&[], vec![entry(1, "ds-a", "v1", &[])]),
    )]));

    let mut hasher = Sha256::new();
    hasher.update(b"cmip6\tds-a\tv1\n");
    assert_eq!(datasets.hash(), format!("{:x}", hasher.finalize()));
  }

  #[test]
  fn dataset_hash_changes_with_version() {
    let v1 = ExecutionDatasets::new(BTreeMap::from([(
      SourceType::Cmip6,
      collection(&[], vec![entry(1, "ds-a", "v1", &[])]),
    )]));
    let v2 = ExecutionDatasets::new(BTreeMap::from([(
      SourceType::Cmip6,
      collection(&[], vec![entry(1, "ds-a", "v2", &[])]),
    )]));
    assert_ne!(v1.hash(), v2.hash());
  }

  #[test]
  fn time_range_rejects_empty_interval() {
    let t0 = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    assert!(TimeRange::new(t0, t0).is_err());
  }
}
