//! Path expansion: globs and directory walks.

use std::path::{Path, PathBuf};

use glob::glob;
use walkdir::WalkDir;

use crate::{Error, Result};

/// Expand the given paths into candidate files.
///
/// Each path may be a file, a directory (walked recursively for files
/// matching `pattern`), or a glob pattern. Paths are taken as given, so
/// callers should pass absolute paths. The result is sorted and
/// deduplicated.
pub fn expand_paths(paths: &[String], pattern: &str) -> Result<Vec<PathBuf>> {
  let mut files: Vec<PathBuf> = Vec::new();

  for path in paths {
    if path.contains(['*', '?', '[']) {
      let matches = glob(path).map_err(|e| Error::InvalidPattern {
        pattern: path.clone(),
        reason:  e.to_string(),
      })?;
      for entry in matches {
        let entry = entry.map_err(|e| Error::InvalidPattern {
          pattern: path.clone(),
          reason:  e.to_string(),
        })?;
        if entry.is_dir() {
          walk_directory(&entry, pattern, &mut files);
        } else {
          files.push(entry);
        }
      }
    } else {
      let path = Path::new(path);
      if path.is_dir() {
        walk_directory(path, pattern, &mut files);
      } else {
        files.push(path.to_path_buf());
      }
    }
  }

  files.sort();
  files.dedup();
  Ok(files)
}

fn walk_directory(dir: &Path, pattern: &str, files: &mut Vec<PathBuf>) {
  // Patterns are simple `*.<ext>` forms; match on the extension.
  let extension = pattern.rsplit('.').next().unwrap_or("nc");

  for entry in WalkDir::new(dir)
    .follow_links(true)
    .into_iter()
    .filter_map(|e| e.ok())
  {
    if entry.file_type().is_file()
      && entry.path().extension().and_then(|ext| ext.to_str())
        == Some(extension)
    {
      files.push(entry.path().to_path_buf());
    }
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use super::*;

  #[test]
  fn directories_are_walked_for_matching_files() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a/b");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("one.nc"), b"x").unwrap();
    fs::write(nested.join("two.nc"), b"x").unwrap();
    fs::write(nested.join("ignored.txt"), b"x").unwrap();

    let files = expand_paths(
      &[dir.path().to_string_lossy().into_owned()],
      "*.nc",
    )
    .unwrap();
    assert_eq!(files.len(), 2);
  }

  #[test]
  fn globs_are_expanded() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("one.nc"), b"x").unwrap();
    fs::write(dir.path().join("two.nc"), b"x").unwrap();

    let pattern = dir.path().join("*.nc").to_string_lossy().into_owned();
    let files = expand_paths(&[pattern], "*.nc").unwrap();
    assert_eq!(files.len(), 2);
  }

  #[test]
  fn duplicates_are_collapsed() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("one.nc");
    fs::write(&file, b"x").unwrap();

    let as_file = file.to_string_lossy().into_owned();
    let as_dir = dir.path().to_string_lossy().into_owned();
    let files = expand_paths(&[as_file, as_dir], "*.nc").unwrap();
    assert_eq!(files.len(), 1);
  }
}
