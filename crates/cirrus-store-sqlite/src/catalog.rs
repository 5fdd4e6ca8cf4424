//! Provider/diagnostic registry rows and the dataset catalog side of
//! [`SqliteStore`].

use std::collections::BTreeMap;

use chrono::Utc;
use cirrus_core::{
  dataset::{CatalogEntry, DataCatalog, SourceType},
  store::{DiagnosticRow, NewDataset, ProviderRow},
};
use rusqlite::OptionalExtension as _;

use crate::{
  Result,
  encode::{decode_time_range, encode_dt, encode_time_range},
  store::SqliteStore,
};

impl SqliteStore {
  pub(crate) async fn register_provider_impl(
    &self,
    slug: String,
    version: String,
  ) -> Result<ProviderRow> {
    let row = self
      .conn()
      .call(move |conn| {
        conn.execute(
          "INSERT INTO provider (slug, version) VALUES (?1, ?2)
           ON CONFLICT(slug) DO UPDATE SET version = excluded.version",
          rusqlite::params![slug, version],
        )?;
        let row = conn.query_row(
          "SELECT id, slug, version FROM provider WHERE slug = ?1",
          rusqlite::params![slug],
          |row| {
            Ok(ProviderRow {
              id:      row.get(0)?,
              slug:    row.get(1)?,
              version: row.get(2)?,
            })
          },
        )?;
        Ok(row)
      })
      .await?;
    Ok(row)
  }

  pub(crate) async fn register_diagnostic_impl(
    &self,
    provider_id: i64,
    slug: String,
  ) -> Result<DiagnosticRow> {
    let row = self
      .conn()
      .call(move |conn| {
        conn.execute(
          "INSERT OR IGNORE INTO diagnostic (provider_id, slug)
           VALUES (?1, ?2)",
          rusqlite::params![provider_id, slug],
        )?;
        let row = conn.query_row(
          "SELECT id, provider_id, slug FROM diagnostic
           WHERE provider_id = ?1 AND slug = ?2",
          rusqlite::params![provider_id, slug],
          |row| {
            Ok(DiagnosticRow {
              id:          row.get(0)?,
              provider_id: row.get(1)?,
              slug:        row.get(2)?,
            })
          },
        )?;
        Ok(row)
      })
      .await?;
    Ok(row)
  }

  pub(crate) async fn find_diagnostic_impl(
    &self,
    provider_slug: String,
    diagnostic_slug: String,
  ) -> Result<Option<DiagnosticRow>> {
    let row = self
      .conn()
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT d.id, d.provider_id, d.slug
               FROM diagnostic d
               JOIN provider p ON p.id = d.provider_id
               WHERE p.slug = ?1 AND d.slug = ?2",
              rusqlite::params![provider_slug, diagnostic_slug],
              |row| {
                Ok(DiagnosticRow {
                  id:          row.get(0)?,
                  provider_id: row.get(1)?,
                  slug:        row.get(2)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;
    Ok(row)
  }

  /// Flag groups of unregistered diagnostics stale.
  pub(crate) async fn flag_stale_groups_impl(
    &self,
    registered: Vec<(String, String)>,
  ) -> Result<u64> {
    let flagged = self
      .conn()
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT d.id, p.slug, d.slug
           FROM diagnostic d JOIN provider p ON p.id = d.provider_id",
        )?;
        let known = stmt
          .query_map([], |row| {
            Ok((
              row.get::<_, i64>(0)?,
              row.get::<_, String>(1)?,
              row.get::<_, String>(2)?,
            ))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut flagged = 0u64;
        for (diagnostic_id, provider_slug, diagnostic_slug) in known {
          let active = registered
            .iter()
            .any(|(p, d)| *p == provider_slug && *d == diagnostic_slug);
          if !active {
            flagged += conn.execute(
              "UPDATE execution_group SET stale = 1
               WHERE diagnostic_id = ?1 AND stale = 0",
              rusqlite::params![diagnostic_id],
            )? as u64;
          }
        }
        Ok(flagged)
      })
      .await?;
    Ok(flagged)
  }

  // ── Datasets ──────────────────────────────────────────────────────────────

  pub(crate) async fn insert_dataset_impl(
    &self,
    dataset: NewDataset,
  ) -> Result<(i64, bool)> {
    let created_at = encode_dt(Utc::now());

    let result = self
      .conn()
      .call(move |conn| {
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
          .query_row(
            "SELECT id FROM dataset
             WHERE source_type = ?1 AND instance_id = ?2 AND version = ?3",
            rusqlite::params![
              dataset.source_type.as_str(),
              dataset.instance_id,
              dataset.version
            ],
            |row| row.get(0),
          )
          .optional()?;

        let (dataset_id, created) = match existing {
          Some(id) => (id, false),
          None => {
            tx.execute(
              "INSERT INTO dataset
                 (source_type, instance_id, version, created_at)
               VALUES (?1, ?2, ?3, ?4)",
              rusqlite::params![
                dataset.source_type.as_str(),
                dataset.instance_id,
                dataset.version,
                created_at
              ],
            )?;
            let id = tx.last_insert_rowid();
            for (facet, value) in &dataset.facets {
              tx.execute(
                "INSERT INTO dataset_facet (dataset_id, facet, value)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![id, facet, value],
              )?;
            }
            (id, true)
          }
        };

        // File rows are keyed by path; a path reappearing under a newer
        // dataset version moves to that version's row.
        for file in &dataset.files {
          let (start, end) = encode_time_range(file.time_range.as_ref());
          tx.execute(
            "INSERT INTO dataset_file
               (dataset_id, path, size, checksum, variable_id,
                start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(path) DO UPDATE SET
               dataset_id = excluded.dataset_id,
               size = excluded.size,
               checksum = excluded.checksum,
               variable_id = excluded.variable_id,
               start_time = excluded.start_time,
               end_time = excluded.end_time",
            rusqlite::params![
              dataset_id,
              file.path.to_string_lossy().into_owned(),
              file.size as i64,
              file.checksum,
              file.variable_id,
              start,
              end
            ],
          )?;
        }

        tx.commit()?;
        Ok((dataset_id, created))
      })
      .await?;
    Ok(result)
  }

  pub(crate) async fn retract_dataset_impl(
    &self,
    source_type: SourceType,
    instance_id: String,
  ) -> Result<u64> {
    let changed = self
      .conn()
      .call(move |conn| {
        let changed = conn.execute(
          "UPDATE dataset SET retracted = 1
           WHERE source_type = ?1 AND instance_id = ?2 AND retracted = 0",
          rusqlite::params![source_type.as_str(), instance_id],
        )?;
        Ok(changed as u64)
      })
      .await?;
    Ok(changed)
  }

  /// The active catalog: file entries of the latest non-retracted version
  /// of each dataset, facets attached.
  pub(crate) async fn load_catalog_impl(
    &self,
    source_type: SourceType,
  ) -> Result<DataCatalog> {
    struct RawEntry {
      dataset_id:  i64,
      instance_id: String,
      version:     String,
      path:        String,
      start_time:  Option<String>,
      end_time:    Option<String>,
    }

    let (raw_entries, raw_facets) = self
      .conn()
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT d.id, d.instance_id, d.version, f.path,
                  f.start_time, f.end_time
           FROM dataset d
           JOIN dataset_file f ON f.dataset_id = d.id
           WHERE d.source_type = ?1
             AND d.retracted = 0
             AND d.version = (
               SELECT max(d2.version) FROM dataset d2
               WHERE d2.source_type = d.source_type
                 AND d2.instance_id = d.instance_id
                 AND d2.retracted = 0)
           ORDER BY d.instance_id, f.path",
        )?;
        let entries = stmt
          .query_map(rusqlite::params![source_type.as_str()], |row| {
            Ok(RawEntry {
              dataset_id:  row.get(0)?,
              instance_id: row.get(1)?,
              version:     row.get(2)?,
              path:        row.get(3)?,
              start_time:  row.get(4)?,
              end_time:    row.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut stmt = conn.prepare(
          "SELECT dataset_id, facet, value FROM dataset_facet",
        )?;
        let facets = stmt
          .query_map([], |row| {
            Ok((
              row.get::<_, i64>(0)?,
              row.get::<_, String>(1)?,
              row.get::<_, String>(2)?,
            ))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((entries, facets))
      })
      .await?;

    let mut facets_by_dataset: BTreeMap<i64, BTreeMap<String, String>> =
      BTreeMap::new();
    for (dataset_id, facet, value) in raw_facets {
      facets_by_dataset.entry(dataset_id).or_default().insert(facet, value);
    }

    let entries = raw_entries
      .into_iter()
      .map(|raw| {
        Ok(CatalogEntry {
          dataset_id:  raw.dataset_id,
          instance_id: raw.instance_id,
          version:     raw.version,
          path:        raw.path.into(),
          time_range:  decode_time_range(
            raw.start_time.as_deref(),
            raw.end_time.as_deref(),
          )?,
          facets:      facets_by_dataset
            .get(&raw.dataset_id)
            .cloned()
            .unwrap_or_default(),
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(DataCatalog::new(source_type, entries))
  }
}
