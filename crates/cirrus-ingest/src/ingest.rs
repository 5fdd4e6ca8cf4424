//! The ingest operation: walk, extract, group, store.

use std::collections::BTreeMap;

use cirrus_core::{
  dataset::SourceType,
  store::{EvaluationStore, NewDataset, NewFile},
};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
  Error, Result,
  adapter::{FileRecord, adapter_for},
  cmip6::Cmip6Parser,
  walk::expand_paths,
};

/// Options for [`ingest`].
#[derive(Debug, Clone)]
pub struct IngestOptions {
  /// Log and continue on a file that fails to parse instead of aborting
  /// the whole ingest.
  pub skip_invalid: bool,
  /// Worker threads for metadata extraction; `0` uses the default pool
  /// size.
  pub n_jobs:       usize,
  /// CMIP6 parser mode; ignored for other source types.
  pub parser:       Cmip6Parser,
}

impl Default for IngestOptions {
  fn default() -> IngestOptions {
    IngestOptions {
      skip_invalid: true,
      n_jobs:       0,
      parser:       Cmip6Parser::default(),
    }
  }
}

/// Counters reported by one [`ingest`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
  pub files_found:       usize,
  pub files_parsed:      usize,
  pub files_skipped:     usize,
  pub datasets_created:  usize,
  pub datasets_existing: usize,
}

/// Ingest the files under `paths` into the store as `source_type`
/// datasets.
///
/// Idempotent: re-ingesting identical paths produces no new rows;
/// ingesting a newer version of a known instance id supersedes it as the
/// active version while the prior row is retained.
pub async fn ingest<S: EvaluationStore>(
  store: &S,
  source_type: SourceType,
  paths: &[String],
  options: &IngestOptions,
) -> Result<IngestSummary> {
  let adapter = adapter_for(source_type, options.parser);
  let files = expand_paths(paths, adapter.file_pattern())?;

  let mut summary = IngestSummary {
    files_found: files.len(),
    ..Default::default()
  };
  info!(
    source_type = %source_type,
    files = files.len(),
    "extracting dataset metadata"
  );

  // Fan the adapter out across a worker pool; extraction is I/O plus
  // checksumming and dominates ingest time.
  let extracted: Vec<(std::path::PathBuf, Result<FileRecord>)> = {
    let adapter = adapter.as_ref();
    let jobs =
      || {
        files.par_iter().map(|path| {
          (path.clone(), adapter.extract_file_metadata(path))
        })
      };

    if options.n_jobs > 0 {
      let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.n_jobs)
        .build()
        .map_err(|e| Error::WorkerPool(e.to_string()))?;
      pool.install(|| jobs().collect())
    } else {
      jobs().collect()
    }
  };

  // Route failures through the skip_invalid channel.
  let mut records: Vec<FileRecord> = Vec::with_capacity(extracted.len());
  for (path, result) in extracted {
    match result {
      Ok(record) => records.push(record),
      Err(e) if options.skip_invalid => {
        warn!(path = %path.display(), reason = %e, "skipping invalid file");
        summary.files_skipped += 1;
      }
      Err(e) => return Err(e),
    }
  }
  summary.files_parsed = records.len();

  // Group records into datasets; the dataset version is the maximum of its
  // file versions and its facets come from a file of that version.
  let mut grouped: BTreeMap<String, Vec<FileRecord>> = BTreeMap::new();
  for record in records {
    grouped.entry(record.instance_id.clone()).or_default().push(record);
  }

  for (instance_id, group) in grouped {
    let version = group
      .iter()
      .map(|r| r.version.clone())
      .max()
      .unwrap_or_else(|| "v0".to_string());
    let facets = group
      .iter()
      .find(|r| r.version == version)
      .map(|r| r.facets.clone())
      .unwrap_or_default();

    let files = group
      .into_iter()
      .map(|record| NewFile {
        path:        record.path,
        size:        record.size,
        checksum:    record.checksum,
        variable_id: record.variable_id,
        time_range:  record.time_range,
      })
      .collect();

    let (_, created) = store
      .insert_dataset(NewDataset {
        source_type,
        instance_id,
        version,
        facets,
        files,
      })
      .await
      .map_err(|e| Error::Store(Box::new(e)))?;

    if created {
      summary.datasets_created += 1;
    } else {
      summary.datasets_existing += 1;
    }
  }

  info!(
    parsed = summary.files_parsed,
    skipped = summary.files_skipped,
    created = summary.datasets_created,
    existing = summary.datasets_existing,
    "ingest finished"
  );
  Ok(summary)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use std::{fs, path::Path};

  use cirrus_store_sqlite::SqliteStore;

  use super::*;

  fn drs_dir(root: &Path, version: &str) -> std::path::PathBuf {
    let dir = root.join(format!(
      "CMIP6/CMIP/CSIRO/ACCESS-ESM1-5/historical/r1i1p1f1/Amon/tas/gn/{version}"
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
  }

  fn write_file(dir: &Path, name: &str) {
    fs::write(dir.join(name), b"data").unwrap();
  }

  #[tokio::test]
  async fn ingest_groups_files_into_one_dataset() {
    let data = tempfile::tempdir().unwrap();
    let dir = drs_dir(data.path(), "v20210316");
    write_file(
      &dir,
      "tas_Amon_ACCESS-ESM1-5_historical_r1i1p1f1_gn_185001-194912.nc",
    );
    write_file(
      &dir,
      "tas_Amon_ACCESS-ESM1-5_historical_r1i1p1f1_gn_195001-201412.nc",
    );

    let store = SqliteStore::open_in_memory().await.unwrap();
    let summary = ingest(
      &store,
      SourceType::Cmip6,
      &[data.path().to_string_lossy().into_owned()],
      &IngestOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.files_found, 2);
    assert_eq!(summary.files_parsed, 2);
    assert_eq!(summary.datasets_created, 1);

    let catalog = store.load_catalog(SourceType::Cmip6).await.unwrap();
    assert_eq!(catalog.len(), 2);
    assert_eq!(
      catalog.entries[0].instance_id,
      "CMIP6.CMIP.CSIRO.ACCESS-ESM1-5.historical.r1i1p1f1.Amon.tas.gn"
    );
  }

  #[tokio::test]
  async fn ingest_twice_is_idempotent() {
    let data = tempfile::tempdir().unwrap();
    let dir = drs_dir(data.path(), "v20210316");
    write_file(
      &dir,
      "tas_Amon_ACCESS-ESM1-5_historical_r1i1p1f1_gn_185001-194912.nc",
    );

    let store = SqliteStore::open_in_memory().await.unwrap();
    let paths = [data.path().to_string_lossy().into_owned()];

    let first = ingest(
      &store,
      SourceType::Cmip6,
      &paths,
      &IngestOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(first.datasets_created, 1);

    let second = ingest(
      &store,
      SourceType::Cmip6,
      &paths,
      &IngestOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(second.datasets_created, 0);
    assert_eq!(second.datasets_existing, 1);
  }

  #[tokio::test]
  async fn newer_version_becomes_active() {
    let data = tempfile::tempdir().unwrap();
    let old = drs_dir(data.path(), "v20200101");
    write_file(
      &old,
      "tas_Amon_ACCESS-ESM1-5_historical_r1i1p1f1_gn_185001-194912.nc",
    );

    let store = SqliteStore::open_in_memory().await.unwrap();
    let paths = [data.path().to_string_lossy().into_owned()];
    ingest(&store, SourceType::Cmip6, &paths, &IngestOptions::default())
      .await
      .unwrap();

    let new = drs_dir(data.path(), "v20210316");
    write_file(
      &new,
      "tas_Amon_ACCESS-ESM1-5_historical_r1i1p1f1_gn_185001-194912.nc",
    );
    let summary =
      ingest(&store, SourceType::Cmip6, &paths, &IngestOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.datasets_created, 1);

    let catalog = store.load_catalog(SourceType::Cmip6).await.unwrap();
    assert!(catalog.entries.iter().all(|e| e.version == "v20210316"));
  }

  #[tokio::test]
  async fn invalid_files_are_skipped_or_fatal() {
    let data = tempfile::tempdir().unwrap();
    let dir = drs_dir(data.path(), "v20210316");
    write_file(
      &dir,
      "tas_Amon_ACCESS-ESM1-5_historical_r1i1p1f1_gn_185001-194912.nc",
    );
    write_file(&dir, "garbage.nc");

    let store = SqliteStore::open_in_memory().await.unwrap();
    let paths = [data.path().to_string_lossy().into_owned()];

    let lenient = ingest(
      &store,
      SourceType::Cmip6,
      &paths,
      &IngestOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(lenient.files_skipped, 1);
    assert_eq!(lenient.datasets_created, 1);

    let strict = ingest(&store, SourceType::Cmip6, &paths, &IngestOptions {
      skip_invalid: false,
      ..Default::default()
    })
    .await;
    assert!(strict.is_err());
  }
}
