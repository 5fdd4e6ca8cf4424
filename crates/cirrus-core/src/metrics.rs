//! Scalar and series metric values extracted from diagnostic executions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// A scalar value keyed by facet dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarMetricValue {
  /// Facet name → value pairs used for faceted search.
  pub dimensions: BTreeMap<String, String>,
  pub value:      f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub attributes: Option<BTreeMap<String, Value>>,
}

/// A 1-d array with an associated index, keyed by facet dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMetricValue {
  pub dimensions: BTreeMap<String, String>,
  pub values:     Vec<f64>,
  /// Index values; strings or numbers, same length as `values`, unique.
  pub index:      Vec<Value>,
  pub index_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub attributes: Option<BTreeMap<String, Value>>,
}

impl SeriesMetricValue {
  pub fn validate(&self) -> Result<()> {
    if self.values.len() != self.index.len() {
      return Err(Error::InvalidInput(format!(
        "series {:?} has {} values but {} index entries",
        self.index_name,
        self.values.len(),
        self.index.len()
      )));
    }
    let mut seen = BTreeSet::new();
    for value in &self.index {
      if !matches!(value, Value::String(_) | Value::Number(_)) {
        return Err(Error::InvalidInput(format!(
          "series index values must be strings or numbers, got {value}"
        )));
      }
      if !seen.insert(value.to_string()) {
        return Err(Error::InvalidInput(format!(
          "series index value {value} is not unique"
        )));
      }
    }
    Ok(())
  }
}

/// Check a value's dimensions against the facets a diagnostic declares:
/// every declared facet must be present and nothing else may be.
pub fn validate_facets(
  dimensions: &BTreeMap<String, String>,
  declared: &[String],
) -> Result<()> {
  let declared: BTreeSet<&str> =
    declared.iter().map(String::as_str).collect();
  let present: BTreeSet<&str> =
    dimensions.keys().map(String::as_str).collect();

  let missing: Vec<&str> = declared.difference(&present).copied().collect();
  let unknown: Vec<&str> = present.difference(&declared).copied().collect();

  if missing.is_empty() && unknown.is_empty() {
    return Ok(());
  }
  Err(Error::FacetMismatch(format!(
    "missing {missing:?}, unknown {unknown:?}"
  )))
}
