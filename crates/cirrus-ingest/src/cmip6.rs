//! CMIP6 dataset adapter.
//!
//! Two parser modes: `drs` derives every facet from the DRS path layout
//! (`.../<activity>/<institution>/<source>/<experiment>/<member>/<table>/
//! <variable>/<grid>/<version>/<filename>`); `complete` additionally opens
//! the file and reads its global attributes, which win over path-derived
//! values. netCDF-4 (HDF5) files fall back to the path parse.

use std::{collections::BTreeMap, path::Path};

use cirrus_core::dataset::SourceType;
use tracing::debug;

use crate::{
  Error, Result,
  adapter::{
    DatasetAdapter, FileRecord, parse_time_token, size_and_checksum,
    version_from_path,
  },
  nc,
};

/// How CMIP6 metadata is extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cmip6Parser {
  /// Facets from path segments only; never opens the file.
  #[default]
  Drs,
  /// Full attribute read from the file header, path facets as fallback.
  Complete,
}

impl Cmip6Parser {
  pub fn parse(s: &str) -> Option<Cmip6Parser> {
    match s {
      "drs" => Some(Cmip6Parser::Drs),
      "complete" => Some(Cmip6Parser::Complete),
      _ => None,
    }
  }
}

/// Facet names of the filename tokens, in DRS order.
const FILENAME_FACETS: [&str; 6] = [
  "variable_id",
  "table_id",
  "source_id",
  "experiment_id",
  "member_id",
  "grid_label",
];

/// Directory facets above the version directory, nearest first.
const DIRECTORY_FACETS: [&str; 8] = [
  "grid_label",
  "variable_id",
  "table_id",
  "member_id",
  "experiment_id",
  "source_id",
  "institution_id",
  "activity_id",
];

/// Facets composing the instance id, in order.
const INSTANCE_FACETS: [&str; 8] = [
  "activity_id",
  "institution_id",
  "source_id",
  "experiment_id",
  "member_id",
  "table_id",
  "variable_id",
  "grid_label",
];

pub struct Cmip6Adapter {
  parser: Cmip6Parser,
}

impl Cmip6Adapter {
  pub fn new(parser: Cmip6Parser) -> Cmip6Adapter {
    Cmip6Adapter { parser }
  }

  /// Parse facets and the optional time range from the DRS path alone.
  fn parse_drs(
    &self,
    path: &Path,
  ) -> Result<(BTreeMap<String, String>, Option<cirrus_core::dataset::TimeRange>)>
  {
    let stem = path
      .file_stem()
      .and_then(|s| s.to_str())
      .ok_or_else(|| Error::Parse {
        path:   path.to_path_buf(),
        reason: "filename is not valid UTF-8".to_string(),
      })?;

    let tokens: Vec<&str> = stem.split('_').collect();
    if tokens.len() != FILENAME_FACETS.len()
      && tokens.len() != FILENAME_FACETS.len() + 1
    {
      return Err(Error::Parse {
        path:   path.to_path_buf(),
        reason: format!(
          "expected {} or {} filename tokens, found {}",
          FILENAME_FACETS.len(),
          FILENAME_FACETS.len() + 1,
          tokens.len()
        ),
      });
    }

    let mut facets = BTreeMap::new();
    for (facet, token) in FILENAME_FACETS.iter().zip(&tokens) {
      facets.insert(facet.to_string(), token.to_string());
    }
    // variant_label mirrors member_id, matching the CMOR attribute name.
    facets
      .insert("variant_label".to_string(), facets["member_id"].clone());

    let time_range = tokens
      .get(FILENAME_FACETS.len())
      .map(|token| parse_time_token(path, token))
      .transpose()?;

    // Directory-only facets (institution, activity) when the tree is a full
    // DRS layout: the segments above the version directory.
    let mut ancestors: Vec<&str> = path
      .parent()
      .map(|p| {
        p.components()
          .filter_map(|c| c.as_os_str().to_str())
          .collect()
      })
      .unwrap_or_default();
    ancestors.reverse();
    if ancestors
      .first()
      .is_some_and(|s| crate::adapter::is_version_segment(s))
    {
      for (facet, segment) in DIRECTORY_FACETS.iter().zip(&ancestors[1..]) {
        facets.entry(facet.to_string()).or_insert_with(|| segment.to_string());
      }
    }

    Ok((facets, time_range))
  }

  fn build_record(
    &self,
    path: &Path,
    facets: BTreeMap<String, String>,
    time_range: Option<cirrus_core::dataset::TimeRange>,
  ) -> Result<FileRecord> {
    let version = version_from_path(path).unwrap_or_else(|| "v0".to_string());
    let instance_id = INSTANCE_FACETS
      .iter()
      .filter_map(|facet| facets.get(*facet).map(String::as_str))
      .fold("CMIP6".to_string(), |acc, part| format!("{acc}.{part}"));

    let (size, checksum) = size_and_checksum(path)?;
    let variable_id = facets.get("variable_id").cloned();

    Ok(FileRecord {
      path: path.to_path_buf(),
      instance_id,
      version,
      facets,
      variable_id,
      time_range,
      size,
      checksum,
    })
  }
}

impl DatasetAdapter for Cmip6Adapter {
  fn source_type(&self) -> SourceType {
    SourceType::Cmip6
  }

  fn extract_file_metadata(&self, path: &Path) -> Result<FileRecord> {
    let (mut facets, time_range) = self.parse_drs(path)?;

    if self.parser == Cmip6Parser::Complete {
      match nc::read_global_attributes(path) {
        Ok(attributes) => {
          // File attributes are authoritative over path segments.
          for (name, value) in attributes {
            facets.insert(name, value);
          }
          if let Some(variant) = facets.get("variant_label").cloned() {
            facets.insert("member_id".to_string(), variant);
          }
        }
        Err(Error::NotClassicNetcdf(_)) => {
          debug!(
            path = %path.display(),
            "netCDF-4 file; falling back to DRS path metadata"
          );
        }
        Err(e) => return Err(e),
      }
    }

    self.build_record(path, facets, time_range)
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
