//! The CMEC output bundle: a manifest of the files an execution produced.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, cmec::strip_nulls};

/// Filename of the output bundle within an execution's output directory.
pub const OUTPUT_BUNDLE_FILENAME: &str = "output.json";

/// The section of the bundle an output file was listed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSection {
  Data,
  Plots,
  Html,
  Metrics,
}

/// One entry in a bundle section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
  /// Path relative to the execution's output directory.
  pub filename:    String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub long_name:   Option<String>,
}

/// Provenance block; free-form apart from the log filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
  #[serde(default)]
  pub environment: BTreeMap<String, Value>,
  #[serde(default)]
  pub modeldata:   Vec<Value>,
  #[serde(default)]
  pub obsdata:     BTreeMap<String, Value>,
  /// Filename of the captured execution log, relative to the output
  /// directory.
  pub log:         String,
}

impl Default for Provenance {
  fn default() -> Provenance {
    Provenance {
      environment: BTreeMap::new(),
      modeldata:   Vec::new(),
      obsdata:     BTreeMap::new(),
      log:         crate::diagnostic::EXECUTION_LOG_FILENAME.to_string(),
    }
  }
}

/// The full output bundle written to `output.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputBundle {
  #[serde(default)]
  pub provenance: Provenance,
  /// Landing page for the execution, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub index:      Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub data:       BTreeMap<String, OutputFile>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub plots:      BTreeMap<String, OutputFile>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub html:       BTreeMap<String, OutputFile>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub metrics:    BTreeMap<String, OutputFile>,
}

impl OutputBundle {
  /// Iterate every listed file with its section and short name.
  pub fn files(
    &self,
  ) -> impl Iterator<Item = (OutputSection, &str, &OutputFile)> {
    let sections = [
      (OutputSection::Data, &self.data),
      (OutputSection::Plots, &self.plots),
      (OutputSection::Html, &self.html),
      (OutputSection::Metrics, &self.metrics),
    ];
    sections.into_iter().flat_map(|(section, map)| {
      map.iter().map(move |(key, file)| (section, key.as_str(), file))
    })
  }

  pub fn write(&self, path: &Path) -> Result<()> {
    let mut value = serde_json::to_value(self)?;
    strip_nulls(&mut value);
    fs::write(path, serde_json::to_vec_pretty(&value)?)?;
    Ok(())
  }

  pub fn read(path: &Path) -> Result<OutputBundle> {
    let mut value: Value = serde_json::from_slice(&fs::read(path)?)?;
    strip_nulls(&mut value);
    Ok(serde_json::from_value(value)?)
  }
}
