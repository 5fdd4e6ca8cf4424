//! obs4MIPs dataset adapter.
//!
//! Reads the file's global attributes (obs4MIPs files are CMOR-written and
//! carry their facets as attributes); filename tokens are the fallback when
//! the file is netCDF-4. PMP climatologies are post-processed obs4MIPs
//! datasets and parse identically, but are catalogued under their own
//! source type because their metadata may collide with the source data.

use std::{collections::BTreeMap, path::Path};

use cirrus_core::dataset::{SourceType, TimeRange};
use tracing::debug;

use crate::{
  Error, Result,
  adapter::{
    DatasetAdapter, FileRecord, parse_time_token, size_and_checksum,
    version_from_path,
  },
  nc,
};

/// Attribute names copied into facets when present.
const FACET_ATTRIBUTES: [&str; 13] = [
  "activity_id",
  "frequency",
  "grid",
  "grid_label",
  "institution_id",
  "nominal_resolution",
  "realm",
  "product",
  "source_id",
  "source_type",
  "variable_id",
  "variant_label",
  "source_version_number",
];

pub struct Obs4MipsAdapter {
  source_type: SourceType,
}

impl Obs4MipsAdapter {
  pub fn new(source_type: SourceType) -> Obs4MipsAdapter {
    Obs4MipsAdapter { source_type }
  }

  fn instance_prefix(&self) -> &'static str {
    match self.source_type {
      SourceType::PmpClimatology => "PMPClim",
      _ => "obs4MIPs",
    }
  }

  /// Facets from the filename: `<variable_id>_<source_id>[_...][_<times>]`.
  fn parse_filename(
    &self,
    path: &Path,
  ) -> Result<(BTreeMap<String, String>, Option<TimeRange>)> {
    let stem = path
      .file_stem()
      .and_then(|s| s.to_str())
      .ok_or_else(|| Error::Parse {
        path:   path.to_path_buf(),
        reason: "filename is not valid UTF-8".to_string(),
      })?;

    let tokens: Vec<&str> = stem.split('_').collect();
    if tokens.len() < 2 {
      return Err(Error::Parse {
        path:   path.to_path_buf(),
        reason: format!(
          "expected at least variable and source tokens, found {}",
          tokens.len()
        ),
      });
    }

    let mut facets = BTreeMap::new();
    facets.insert("variable_id".to_string(), tokens[0].to_string());
    facets.insert("source_id".to_string(), tokens[1].to_string());

    // A trailing token that parses as a time range is one.
    let time_range = tokens
      .last()
      .filter(|_| tokens.len() > 2)
      .and_then(|token| parse_time_token(path, token).ok());

    Ok((facets, time_range))
  }
}

impl DatasetAdapter for Obs4MipsAdapter {
  fn source_type(&self) -> SourceType {
    self.source_type
  }

  fn extract_file_metadata(&self, path: &Path) -> Result<FileRecord> {
    let (mut facets, time_range) = self.parse_filename(path)?;

    match nc::read_global_attributes(path) {
      Ok(attributes) => {
        if attributes.get("activity_id").map(String::as_str)
          != Some("obs4MIPs")
        {
          return Err(Error::Parse {
            path:   path.to_path_buf(),
            reason: "not an obs4MIPs dataset (activity_id mismatch)"
              .to_string(),
          });
        }
        for name in FACET_ATTRIBUTES {
          if let Some(value) = attributes.get(name) {
            facets.insert(name.to_string(), value.clone());
          }
        }
      }
      Err(Error::NotClassicNetcdf(_)) => {
        debug!(
          path = %path.display(),
          "netCDF-4 file; using filename metadata only"
        );
      }
      Err(e) => return Err(e),
    }

    // Some obs4MIPs trees omit the leading 'v' on the version directory.
    let version = version_from_path(path)
      .or_else(|| {
        facets
          .get("source_version_number")
          .map(|v| {
            if v.starts_with('v') { v.clone() } else { format!("v{v}") }
          })
      })
      .or_else(|| {
        path
          .parent()
          .and_then(|p| p.file_name())
          .and_then(|n| n.to_str())
          .map(|n| {
            if n.starts_with('v') {
              n.to_string()
            } else {
              format!("v{n}")
            }
          })
      })
      .unwrap_or_else(|| "v1".to_string());

    let instance_id = [
      facets.get("institution_id"),
      facets.get("source_id"),
      facets.get("variable_id"),
      facets.get("grid_label"),
    ]
    .into_iter()
    .flatten()
    .fold(self.instance_prefix().to_string(), |acc, part| {
      format!("{acc}.{part}")
    });

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

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use std::fs;

  use super::*;

  #[test]
  fn filename_fallback_for_netcdf4() {
    let dir = tempfile::tempdir().unwrap();
    let subdir = dir.path().join("v20230101");
    fs::create_dir_all(&subdir).unwrap();
    let path = subdir.join("ts_HadISST-1-1_gn_187001-201812.nc");
    fs::write(&path, b"\x89HDF\r\n\x1a\n").unwrap();

    let adapter = Obs4MipsAdapter::new(SourceType::Obs4mips);
    let record = adapter.extract_file_metadata(&path).unwrap();

    assert_eq!(record.facets["variable_id"], "ts");
    assert_eq!(record.facets["source_id"], "HadISST-1-1");
    assert_eq!(record.version, "v20230101");
    assert!(record.instance_id.starts_with("obs4MIPs."));
    assert!(record.time_range.is_some());
  }

  #[test]
  fn rejects_non_obs4mips_classic_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ts_SOMETHING.nc");

    // A classic file whose activity_id is not obs4MIPs.
    let mut bytes: Vec<u8> = Vec::new();
    bytes.extend(b"CDF\x01");
    bytes.extend(0u32.to_be_bytes());
    bytes.extend([0u8; 8]); // absent dim list
    bytes.extend(0x0Cu32.to_be_bytes()); // attribute list
    bytes.extend(1u32.to_be_bytes());
    bytes.extend(11u32.to_be_bytes()); // name length
    bytes.extend(b"activity_id\x00"); // padded to 12
    bytes.extend(2u32.to_be_bytes()); // NC_CHAR
    bytes.extend(5u32.to_be_bytes());
    bytes.extend(b"CMIP6\x00\x00\x00"); // padded to 8
    fs::write(&path, &bytes).unwrap();

    let adapter = Obs4MipsAdapter::new(SourceType::Obs4mips);
    assert!(matches!(
      adapter.extract_file_metadata(&path),
      Err(Error::Parse { .. })
    ));
  }

  #[test]
  fn pmp_climatologies_get_their_own_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ts_HadISST-1-1_AC.nc");
    fs::write(&path, b"\x89HDF\r\n\x1a\n").unwrap();

    let adapter = Obs4MipsAdapter::new(SourceType::PmpClimatology);
    let record = adapter.extract_file_metadata(&path).unwrap();
    assert!(record.instance_id.starts_with("PMPClim."));
  }
}
