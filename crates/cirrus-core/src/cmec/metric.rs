//! The CMEC metric bundle: nested metric values keyed by declared
//! dimensions.

use std::{
  collections::{BTreeMap, BTreeSet},
  fs,
  path::Path,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
  Error, Result, cmec::strip_nulls, metrics::ScalarMetricValue,
};

/// Filename of the metric bundle within an execution's output directory.
pub const METRIC_BUNDLE_FILENAME: &str = "diagnostic.json";

/// Key allowed at any nesting level for unstructured annotations.
const ATTRIBUTES_KEY: &str = "attributes";

/// Whether unknown values at the deepest dimension level are tolerated
/// (warned about and dropped) instead of failing validation. Overridden
/// with the `CIRRUS_ALLOW_EXTRA_KEYS` environment variable.
fn allow_extra_keys() -> bool {
  match std::env::var("CIRRUS_ALLOW_EXTRA_KEYS") {
    Ok(value) => !matches!(value.as_str(), "0" | "false" | "no"),
    Err(_) => true,
  }
}

/// The `DIMENSIONS` object: the nesting order plus the allowed values of
/// each dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDimensions {
  pub json_structure: Vec<String>,
  /// Dimension name → value → free-form annotation (usually empty).
  #[serde(flatten)]
  pub dimensions:     BTreeMap<String, BTreeMap<String, Value>>,
}

impl MetricDimensions {
  /// The declared values of one dimension.
  fn values(&self, dimension: &str) -> Option<BTreeSet<&str>> {
    self
      .dimensions
      .get(dimension)
      .map(|values| values.keys().map(String::as_str).collect())
  }
}

/// A full metric bundle as read from or written to `diagnostic.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricBundle {
  #[serde(rename = "DIMENSIONS")]
  pub dimensions: MetricDimensions,
  #[serde(rename = "RESULTS")]
  pub results:    Value,
}

impl MetricBundle {
  /// Build a bundle from flat scalar values.
  ///
  /// The dimension value sets are collected from the values themselves;
  /// every value must carry exactly the facets named in `json_structure`.
  pub fn from_values(
    json_structure: Vec<String>,
    values: &[ScalarMetricValue],
  ) -> Result<MetricBundle> {
    let mut dimensions: BTreeMap<String, BTreeMap<String, Value>> =
      json_structure
        .iter()
        .map(|name| (name.clone(), BTreeMap::new()))
        .collect();
    let mut results = Map::new();

    for value in values {
      let mut cursor = &mut results;
      for (level, dimension) in json_structure.iter().enumerate() {
        let Some(dim_value) = value.dimensions.get(dimension) else {
          return Err(Error::BundleValidation {
            bundle: "metric",
            reason: format!(
              "value is missing dimension {dimension:?}: {:?}",
              value.dimensions
            ),
          });
        };
        if let Some(values) = dimensions.get_mut(dimension) {
          values.insert(dim_value.clone(), Value::Object(Map::new()));
        }

        if level + 1 == json_structure.len() {
          cursor.insert(
            dim_value.clone(),
            Value::Number(
              serde_json::Number::from_f64(value.value).ok_or_else(|| {
                Error::BundleValidation {
                  bundle: "metric",
                  reason: format!("value {} is not finite", value.value),
                }
              })?,
            ),
          );
        } else {
          cursor = cursor
            .entry(dim_value.clone())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| Error::BundleValidation {
              bundle: "metric",
              reason: format!(
                "conflicting nesting at dimension value {dim_value:?}"
              ),
            })?;
        }
      }
    }

    let bundle = MetricBundle {
      dimensions: MetricDimensions { json_structure, dimensions },
      results:    Value::Object(results),
    };
    bundle.validate()?;
    Ok(bundle)
  }

  /// Validate the bundle shape with the default policy for unknown
  /// deepest-level keys (see [`MetricBundle::validate_with`]).
  pub fn validate(&self) -> Result<()> {
    self.validate_with(allow_extra_keys())
  }

  /// Validate the bundle shape.
  ///
  /// Checks that the structure names match the dimension maps, that every
  /// intermediate level carries exactly the declared values of its
  /// dimension, and that the deepest level holds scalars only. Unknown
  /// keys at the deepest level are warned about and treated as dropped
  /// when `allow_extra_keys` is set, and rejected otherwise; intermediate
  /// levels are always strict.
  pub fn validate_with(&self, allow_extra_keys: bool) -> Result<()> {
    let structure = &self.dimensions.json_structure;

    let declared: BTreeSet<&str> =
      self.dimensions.dimensions.keys().map(String::as_str).collect();
    let structured: BTreeSet<&str> =
      structure.iter().map(String::as_str).collect();
    if declared != structured {
      return Err(Error::BundleValidation {
        bundle: "metric",
        reason: format!(
          "json_structure {structured:?} does not match dimension keys \
           {declared:?}"
        ),
      });
    }

    let results = self.results.as_object().ok_or(Error::BundleValidation {
      bundle: "metric",
      reason: "RESULTS must be an object".to_string(),
    })?;
    if structure.is_empty() {
      return Ok(());
    }
    self.check_level(results, 0, allow_extra_keys)
  }

  fn check_level(
    &self,
    map: &Map<String, Value>,
    level: usize,
    allow_extra_keys: bool,
  ) -> Result<()> {
    let structure = &self.dimensions.json_structure;
    let dimension = &structure[level];
    let allowed = self.dimensions.values(dimension).unwrap_or_default();

    let keys: BTreeSet<&str> = map
      .keys()
      .map(String::as_str)
      .filter(|key| *key != ATTRIBUTES_KEY)
      .collect();

    if level + 1 < structure.len() {
      // Intermediate levels must carry exactly the declared values.
      if keys != allowed {
        return Err(Error::BundleValidation {
          bundle: "metric",
          reason: format!(
            "dimension key mismatch in {dimension:?} at level {level}: \
             expected {allowed:?}, found {keys:?}"
          ),
        });
      }
      for (key, value) in map {
        if key == ATTRIBUTES_KEY {
          continue;
        }
        let Some(nested) = value.as_object() else {
          return Err(Error::BundleValidation {
            bundle: "metric",
            reason: format!(
              "{dimension:?} is not the deepest dimension; expected an \
               object under {key:?}"
            ),
          });
        };
        self.check_level(nested, level + 1, allow_extra_keys)?;
      }
      return Ok(());
    }

    // Deepest level: a subset of the declared values, holding scalars.
    // Unknown keys are dropped with a warning unless strictness is
    // requested.
    let unknown: Vec<&str> = keys.difference(&allowed).copied().collect();
    if !unknown.is_empty() {
      if !allow_extra_keys {
        return Err(Error::BundleValidation {
          bundle: "metric",
          reason: format!(
            "unknown values {unknown:?} for dimension {dimension:?}"
          ),
        });
      }
      warn!(
        dimension = %dimension,
        unknown = ?unknown,
        "dropping metric values outside the declared dimension"
      );
    }
    for (key, value) in map {
      if key == ATTRIBUTES_KEY || !allowed.contains(key.as_str()) {
        continue;
      }
      if !value.is_number() {
        return Err(Error::BundleValidation {
          bundle: "metric",
          reason: format!(
            "leaf under {dimension:?}={key:?} must be a scalar, got {value}"
          ),
        });
      }
    }
    Ok(())
  }

  /// Flatten the nested results into scalar metric values.
  ///
  /// The bundle must validate first. Deepest-level keys outside the
  /// declared dimension values were dropped during validation and are
  /// never ingested.
  pub fn iter_results(&self) -> Result<Vec<ScalarMetricValue>> {
    self.validate()?;
    let mut out = Vec::new();
    if let Some(map) = self.results.as_object() {
      if self.dimensions.json_structure.is_empty() {
        return Ok(out);
      }
      self.collect_values(map, 0, &mut BTreeMap::new(), &mut out);
    }
    Ok(out)
  }

  fn collect_values(
    &self,
    map: &Map<String, Value>,
    level: usize,
    path: &mut BTreeMap<String, String>,
    out: &mut Vec<ScalarMetricValue>,
  ) {
    let structure = &self.dimensions.json_structure;
    let dimension = &structure[level];
    let terminal = level + 1 == structure.len();
    let allowed = self.dimensions.values(dimension).unwrap_or_default();

    for (key, value) in map {
      if key == ATTRIBUTES_KEY {
        continue;
      }
      if terminal && !allowed.contains(key.as_str()) {
        continue;
      }
      path.insert(dimension.clone(), key.clone());
      if terminal {
        if let Some(number) = value.as_f64() {
          out.push(ScalarMetricValue {
            dimensions: path.clone(),
            value:      number,
            attributes: None,
          });
        }
      } else if let Some(nested) = value.as_object() {
        self.collect_values(nested, level + 1, path, out);
      }
      path.remove(dimension);
    }
  }

  pub fn write(&self, path: &Path) -> Result<()> {
    let mut value = serde_json::to_value(self)?;
    strip_nulls(&mut value);
    fs::write(path, serde_json::to_vec_pretty(&value)?)?;
    Ok(())
  }

  pub fn read(path: &Path) -> Result<MetricBundle> {
    let mut value: Value = serde_json::from_slice(&fs::read(path)?)?;
    strip_nulls(&mut value);
    Ok(serde_json::from_value(value)?)
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn bundle(results: Value) -> MetricBundle {
    serde_json::from_value(json!({
      "DIMENSIONS": {
        "json_structure": ["region", "metric", "statistic"],
        "region": {"global": {}, "tropics": {}},
        "metric": {"bias": {}},
        "statistic": {"mean": {}, "std": {}},
      },
      "RESULTS": results,
    }))
    .unwrap()
  }

  #[test]
  fn valid_bundle_passes_and_flattens() {
    let b = bundle(json!({
      "global": {"bias": {"mean": 0.5, "std": 1.0}},
      "tropics": {"bias": {"mean": -0.2}},
    }));
    b.validate().unwrap();

    let values = b.iter_results().unwrap();
    assert_eq!(values.len(), 3);
    let global_mean = values
      .iter()
      .find(|v| {
        v.dimensions["region"] == "global" && v.dimensions["statistic"] == "mean"
      })
      .unwrap();
    assert_eq!(global_mean.value, 0.5);
  }

  #[test]
  fn object_leaf_at_deepest_level_is_rejected() {
    let b = bundle(json!({
      "global": {"bias": {"mean": {"value": 0.5, "units": "K"}}},
      "tropics": {"bias": {"mean": 0.1}},
    }));
    let err = b.validate().unwrap_err();
    assert!(matches!(err, Error::BundleValidation { .. }));
  }

  #[test]
  fn intermediate_key_mismatch_is_rejected() {
    // An undeclared value at an intermediate level.
    let b = bundle(json!({
      "global": {"rmse": {"mean": 0.5}},
      "tropics": {"bias": {"mean": 0.1}},
    }));
    assert!(b.validate().is_err());
  }

  #[test]
  fn missing_intermediate_value_is_rejected() {
    // Intermediate levels must carry every declared dimension value;
    // "tropics" is declared but absent.
    let b = bundle(json!({
      "global": {"bias": {"mean": 0.5}},
    }));
    assert!(b.validate().is_err());
  }

  #[test]
  fn extra_terminal_keys_are_dropped_not_fatal() {
    // "median" is not a declared statistic: tolerated and dropped by
    // default, rejected under the strict policy.
    let b = bundle(json!({
      "global": {"bias": {"mean": 1.0, "median": 2.0}},
      "tropics": {"bias": {"std": 0.5}},
    }));

    b.validate().unwrap();
    let values = b.iter_results().unwrap();
    assert_eq!(values.len(), 2);
    assert!(
      values.iter().all(|v| v.dimensions["statistic"] != "median")
    );

    assert!(b.validate_with(false).is_err());
  }

  #[test]
  fn structure_mismatch_is_rejected() {
    let b: MetricBundle = serde_json::from_value(json!({
      "DIMENSIONS": {
        "json_structure": ["region"],
        "region": {"global": {}},
        "metric": {"bias": {}},
      },
      "RESULTS": {},
    }))
    .unwrap();
    assert!(b.validate().is_err());
  }

  #[test]
  fn from_values_round_trips_through_iter_results() {
    let values = vec![
      ScalarMetricValue {
        dimensions: BTreeMap::from([
          ("region".to_string(), "global".to_string()),
          ("metric".to_string(), "bias".to_string()),
        ]),
        value:      1.25,
        attributes: None,
      },
      ScalarMetricValue {
        dimensions: BTreeMap::from([
          ("region".to_string(), "tropics".to_string()),
          ("metric".to_string(), "bias".to_string()),
        ]),
        value:      -0.5,
        attributes: None,
      },
    ];
    let b = MetricBundle::from_values(
      vec!["region".to_string(), "metric".to_string()],
      &values,
    )
    .unwrap();

    let mut flattened = b.iter_results().unwrap();
    flattened.sort_by(|a, b| a.dimensions["region"].cmp(&b.dimensions["region"]));
    assert_eq!(flattened, values);
  }

  #[test]
  fn write_read_round_trip_is_lossless() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(METRIC_BUNDLE_FILENAME);

    let b = bundle(json!({
      "global": {"bias": {"mean": 0.5}},
    }));
    b.write(&path).unwrap();
    let read_back = MetricBundle::read(&path).unwrap();
    assert_eq!(read_back, b);
  }
}
