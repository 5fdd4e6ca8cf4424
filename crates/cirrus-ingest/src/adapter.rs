//! The dataset-adapter contract.
//!
//! An adapter knows how to turn one file of its source type into a metadata
//! record. Everything downstream (grouping into datasets, versioning,
//! storage, resolving) is source-type-agnostic; a new source type only
//! needs a new adapter.

use std::{
  collections::BTreeMap,
  fs::File,
  io::Read as _,
  path::Path,
};

use chrono::{NaiveDate, TimeZone, Utc};
use cirrus_core::dataset::{SourceType, TimeRange};
use sha2::{Digest, Sha256};

use crate::{
  Error, Result,
  cmip6::{Cmip6Adapter, Cmip6Parser},
  obs4mips::Obs4MipsAdapter,
};

/// The metadata record extracted from one file.
#[derive(Debug, Clone)]
pub struct FileRecord {
  pub path:        std::path::PathBuf,
  /// Stable dataset identity, shared by all files of one dataset.
  pub instance_id: String,
  pub version:     String,
  pub facets:      BTreeMap<String, String>,
  pub variable_id: Option<String>,
  pub time_range:  Option<TimeRange>,
  pub size:        u64,
  pub checksum:    String,
}

/// Polymorphic extraction over source types.
pub trait DatasetAdapter: Send + Sync {
  fn source_type(&self) -> SourceType;

  /// Glob pattern for candidate files under a walked directory.
  fn file_pattern(&self) -> &str {
    "*.nc"
  }

  fn extract_file_metadata(&self, path: &Path) -> Result<FileRecord>;
}

/// The adapter for a source type; `parser` applies to CMIP6 only.
pub fn adapter_for(
  source_type: SourceType,
  parser: Cmip6Parser,
) -> Box<dyn DatasetAdapter> {
  match source_type {
    SourceType::Cmip6 => Box::new(Cmip6Adapter::new(parser)),
    SourceType::Obs4mips => {
      Box::new(Obs4MipsAdapter::new(SourceType::Obs4mips))
    }
    SourceType::PmpClimatology => {
      // PMP climatologies look like obs4MIPs output and parse the same
      // way; they are catalogued separately because their metadata may
      // collide with the underlying obs4MIPs datasets.
      Box::new(Obs4MipsAdapter::new(SourceType::PmpClimatology))
    }
  }
}

// ─── Shared helpers ──────────────────────────────────────────────────────────

/// File size plus a SHA-256 over the contents.
pub(crate) fn size_and_checksum(path: &Path) -> Result<(u64, String)> {
  let mut file = File::open(path)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 64 * 1024];
  let mut size = 0u64;
  loop {
    let read = file.read(&mut buffer)?;
    if read == 0 {
      break;
    }
    size += read as u64;
    hasher.update(&buffer[..read]);
  }
  Ok((size, format!("{:x}", hasher.finalize())))
}

/// A path component naming a dataset version: `v` followed by digits
/// (`v20210101`, `v1`).
pub(crate) fn is_version_segment(segment: &str) -> bool {
  segment.len() > 1
    && segment.starts_with('v')
    && segment[1..].bytes().all(|b| b.is_ascii_digit())
}

/// Find the version directory in a file's path, most specific first.
pub(crate) fn version_from_path(path: &Path) -> Option<String> {
  path
    .parent()?
    .components()
    .rev()
    .filter_map(|c| c.as_os_str().to_str())
    .find(|segment| is_version_segment(segment))
    .map(str::to_string)
}

/// Parse a filename time token such as `185001-194912` into a half-open
/// range. Supported precisions: year (`1850`), month (`185001`), day
/// (`18500101`).
pub(crate) fn parse_time_token(
  path: &Path,
  token: &str,
) -> Result<TimeRange> {
  let (start_str, end_str) = token.split_once('-').ok_or_else(|| {
    Error::Parse {
      path:   path.to_path_buf(),
      reason: format!("time token {token:?} is not 'start-end'"),
    }
  })?;

  let start = parse_period_start(path, start_str)?;
  let end = parse_period_end(path, end_str)?;
  TimeRange::new(start, end).map_err(|e| Error::Parse {
    path:   path.to_path_buf(),
    reason: e.to_string(),
  })
}

fn parse_digits(path: &Path, s: &str) -> Result<(i32, u32, u32)> {
  let bad = |reason: String| Error::Parse {
    path: path.to_path_buf(),
    reason,
  };
  if !s.bytes().all(|b| b.is_ascii_digit()) {
    return Err(bad(format!("non-numeric time component {s:?}")));
  }
  match s.len() {
    4 => Ok((s.parse().unwrap_or(0), 1, 1)),
    6 => Ok((
      s[..4].parse().unwrap_or(0),
      s[4..6].parse().unwrap_or(1),
      1,
    )),
    8 => Ok((
      s[..4].parse().unwrap_or(0),
      s[4..6].parse().unwrap_or(1),
      s[6..8].parse().unwrap_or(1),
    )),
    _ => Err(bad(format!("unsupported time precision {s:?}"))),
  }
}

fn parse_period_start(
  path: &Path,
  s: &str,
) -> Result<chrono::DateTime<Utc>> {
  let (year, month, day) = parse_digits(path, s)?;
  NaiveDate::from_ymd_opt(year, month, day)
    .map(|d| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap_or_default()))
    .ok_or_else(|| Error::Parse {
      path:   path.to_path_buf(),
      reason: format!("invalid date {s:?}"),
    })
}

/// The exclusive end of a period: the first instant after it.
fn parse_period_end(path: &Path, s: &str) -> Result<chrono::DateTime<Utc>> {
  let (year, month, day) = parse_digits(path, s)?;
  let next = match s.len() {
    4 => NaiveDate::from_ymd_opt(year + 1, 1, 1),
    6 => {
      if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
      } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
      }
    }
    _ => NaiveDate::from_ymd_opt(year, month, day)
      .and_then(|d| d.succ_opt()),
  };
  next
    .map(|d| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap_or_default()))
    .ok_or_else(|| Error::Parse {
      path:   path.to_path_buf(),
      reason: format!("invalid date {s:?}"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
