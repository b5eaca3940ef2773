//! Photo metadata repository.
//!
//! Paths are stored normalized (absolute, forward slashes) and unique per
//! `(path, project_id)`. The three `created_*` fields are derived from
//! `date_taken` or `modified` during upsert and by the backfill pass, never
//! edited directly.

use anyhow::Result;
use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::CatalogDb;

/// Metadata extraction status values for `photo_metadata.metadata_status`.
pub mod metadata_status {
    pub const PENDING: &str = "pending";
    pub const OK: &str = "ok";
    pub const FAILED_RETRY: &str = "failed_retry";
    pub const FAILED: &str = "failed";
}

#[derive(Debug, Clone, Default)]
pub struct PhotoRow {
    pub id: i64,
    pub project_id: i64,
    pub folder_id: i64,
    pub path: String,
    pub size_kb: Option<f64>,
    pub modified: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub date_taken: Option<String>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub title: Option<String>,
    pub caption: Option<String>,
    pub rating: Option<i64>,
    pub file_hash: Option<String>,
    pub image_content_hash: Option<String>,
    pub metadata_status: String,
    pub metadata_fail_count: i64,
    pub created_ts: Option<i64>,
    pub created_date: Option<String>,
    pub created_year: Option<i64>,
    pub updated_at: Option<String>,
}

/// One row of a batched scan upsert.
#[derive(Debug, Clone)]
pub struct PhotoUpsert {
    pub path: std::path::PathBuf,
    pub folder_id: i64,
    pub size_kb: Option<f64>,
    pub modified: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub date_taken: Option<String>,
    pub gps: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataStats {
    pub total: i64,
    pub ok: i64,
    pub pending: i64,
    pub failed_retry: i64,
    pub failed: i64,
}

const PHOTO_COLS: &str = "id, project_id, folder_id, path, size_kb, modified, width, height, \
                          date_taken, gps_latitude, gps_longitude, title, caption, rating, \
                          file_hash, image_content_hash, metadata_status, metadata_fail_count, \
                          created_ts, created_date, created_year, updated_at";

fn photo_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhotoRow> {
    Ok(PhotoRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        folder_id: row.get(2)?,
        path: row.get(3)?,
        size_kb: row.get(4)?,
        modified: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        date_taken: row.get(8)?,
        gps_latitude: row.get(9)?,
        gps_longitude: row.get(10)?,
        title: row.get(11)?,
        caption: row.get(12)?,
        rating: row.get(13)?,
        file_hash: row.get(14)?,
        image_content_hash: row.get(15)?,
        metadata_status: row.get(16)?,
        metadata_fail_count: row.get(17)?,
        created_ts: row.get(18)?,
        created_date: row.get(19)?,
        created_year: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

/// Normalize a media path: absolute, with every backslash converted to a
/// forward slash. This is the only form ever written to the database.
pub fn normalize_media_path(path: &Path) -> String {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    abs.to_string_lossy().replace('\\', "/")
}

/// Derive `(created_ts, created_date, created_year)` from `date_taken`
/// (preferred) or `modified`. Returns all-None when neither parses; that is
/// not an error.
pub fn normalize_created_fields(
    date_taken: Option<&str>,
    modified: Option<&str>,
) -> (Option<i64>, Option<String>, Option<i64>) {
    // EXIF DateTimeOriginal first, then common ISO-ish variants.
    const FORMATS: &[&str] = &[
        "%Y:%m:%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
        "%d.%m.%Y %H:%M:%S",
        "%Y-%m-%d",
    ];

    let parse_one = |s: Option<&str>| -> Option<NaiveDateTime> {
        let s = s?.trim();
        if s.is_empty() {
            return None;
        }
        for fmt in FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Some(dt);
            }
        }
        // Date-only input has no time component to parse into NaiveDateTime
        // with the formats above when seconds are missing.
        if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return d.and_hms_opt(0, 0, 0);
        }
        None
    };

    let Some(dt) = parse_one(date_taken).or_else(|| parse_one(modified)) else {
        return (None, None, None);
    };

    let ts = dt.and_utc().timestamp();
    let date = dt.format("%Y-%m-%d").to_string();
    let year = date[..4].parse::<i64>().ok();
    (Some(ts), Some(date), year)
}

fn now_string() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl CatalogDb {
    /// Insert-or-update a photo row keyed by `(path, project_id)`.
    ///
    /// Recomputes the `created_*` fields, marks `metadata_status = 'ok'` and
    /// zeroes the failure counter when dimensions or `date_taken` arrive.
    /// A second call with identical values leaves the row untouched, so
    /// `updated_at` only moves when a field actually changed. Returns the
    /// row id.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_photo(
        &self,
        path: &Path,
        folder_id: i64,
        project_id: i64,
        size_kb: Option<f64>,
        modified: Option<&str>,
        width: Option<i64>,
        height: Option<i64>,
        date_taken: Option<&str>,
        tags: &[String],
    ) -> Result<i64> {
        let norm_path = normalize_media_path(path);
        let (c_ts, c_date, c_year) = normalize_created_fields(date_taken, modified);
        let ok_meta = (width.is_some() && height.is_some()) || date_taken.is_some();

        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO photo_metadata
                     (path, folder_id, project_id, size_kb, modified, width, height,
                      date_taken, updated_at, created_ts, created_date, created_year,
                      metadata_status, metadata_fail_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                         CASE WHEN ?13 THEN 'ok' ELSE 'pending' END,
                         0)
                 ON CONFLICT(path, project_id) DO UPDATE SET
                     folder_id = excluded.folder_id,
                     size_kb = excluded.size_kb,
                     modified = excluded.modified,
                     width = excluded.width,
                     height = excluded.height,
                     date_taken = excluded.date_taken,
                     updated_at = excluded.updated_at,
                     created_ts = COALESCE(excluded.created_ts, created_ts),
                     created_date = COALESCE(excluded.created_date, created_date),
                     created_year = COALESCE(excluded.created_year, created_year),
                     metadata_status = CASE WHEN ?13 THEN 'ok' ELSE metadata_status END,
                     metadata_fail_count = CASE WHEN ?13 THEN 0 ELSE metadata_fail_count END
                 WHERE photo_metadata.folder_id IS NOT excluded.folder_id
                    OR photo_metadata.size_kb IS NOT excluded.size_kb
                    OR photo_metadata.modified IS NOT excluded.modified
                    OR photo_metadata.width IS NOT excluded.width
                    OR photo_metadata.height IS NOT excluded.height
                    OR photo_metadata.date_taken IS NOT excluded.date_taken",
                params![
                    norm_path, folder_id, project_id, size_kb, modified, width, height,
                    date_taken, now_string(), c_ts, c_date, c_year, ok_meta
                ],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM photo_metadata WHERE path = ? AND project_id = ?",
                params![norm_path, project_id],
                |row| row.get(0),
            )?;
            Ok(id)
        })?;

        for tag in tags {
            let tag_id = self.ensure_tag(tag, project_id)?;
            self.add_tag_to_photo(id, tag_id)?;
        }

        Ok(id)
    }

    /// Batched variant of [`upsert_photo`] used by the scanner: one
    /// transaction per folder keeps large scans off the per-row commit path.
    pub fn upsert_photos_batch(&self, project_id: i64, rows: &[PhotoUpsert]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO photo_metadata
                     (path, folder_id, project_id, size_kb, modified, width, height,
                      date_taken, gps_latitude, gps_longitude, updated_at,
                      created_ts, created_date, created_year,
                      metadata_status, metadata_fail_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         CASE WHEN ?15 THEN 'ok' ELSE 'pending' END,
                         0)
                 ON CONFLICT(path, project_id) DO UPDATE SET
                     folder_id = excluded.folder_id,
                     size_kb = excluded.size_kb,
                     modified = excluded.modified,
                     width = excluded.width,
                     height = excluded.height,
                     date_taken = excluded.date_taken,
                     gps_latitude = COALESCE(excluded.gps_latitude, gps_latitude),
                     gps_longitude = COALESCE(excluded.gps_longitude, gps_longitude),
                     updated_at = excluded.updated_at,
                     created_ts = COALESCE(excluded.created_ts, created_ts),
                     created_date = COALESCE(excluded.created_date, created_date),
                     created_year = COALESCE(excluded.created_year, created_year),
                     metadata_status = CASE WHEN ?15 THEN 'ok' ELSE metadata_status END,
                     metadata_fail_count = CASE WHEN ?15 THEN 0 ELSE metadata_fail_count END
                 WHERE photo_metadata.folder_id IS NOT excluded.folder_id
                    OR photo_metadata.size_kb IS NOT excluded.size_kb
                    OR photo_metadata.modified IS NOT excluded.modified
                    OR photo_metadata.width IS NOT excluded.width
                    OR photo_metadata.height IS NOT excluded.height
                    OR photo_metadata.date_taken IS NOT excluded.date_taken",
            )?;
            let now = now_string();
            for row in rows {
                let norm_path = normalize_media_path(&row.path);
                let (c_ts, c_date, c_year) =
                    normalize_created_fields(row.date_taken.as_deref(), row.modified.as_deref());
                let ok_meta =
                    (row.width.is_some() && row.height.is_some()) || row.date_taken.is_some();
                let (lat, lon) = match row.gps {
                    Some((lat, lon)) => (Some(lat), Some(lon)),
                    None => (None, None),
                };
                stmt.execute(params![
                    norm_path,
                    row.folder_id,
                    project_id,
                    row.size_kb,
                    row.modified,
                    row.width,
                    row.height,
                    row.date_taken,
                    lat,
                    lon,
                    now,
                    c_ts,
                    c_date,
                    c_year,
                    ok_meta
                ])?;
            }
            Ok(rows.len())
        })
    }

    pub fn photo_by_path(&self, project_id: i64, path: &Path) -> Result<Option<PhotoRow>> {
        let norm = normalize_media_path(path);
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {PHOTO_COLS} FROM photo_metadata WHERE path = ? AND project_id = ?"
                    ),
                    params![norm, project_id],
                    photo_from_row,
                )
                .optional()?)
        })
    }

    pub fn photo_by_id(&self, photo_id: i64) -> Result<Option<PhotoRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {PHOTO_COLS} FROM photo_metadata WHERE id = ?"),
                    [photo_id],
                    photo_from_row,
                )
                .optional()?)
        })
    }

    pub fn count_photos(&self, project_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM photo_metadata WHERE project_id = ?",
                [project_id],
                |row| row.get(0),
            )?)
        })
    }

    /// Paths still needing extraction: dimensions or date missing, and not
    /// yet past the failure threshold.
    pub fn missing_metadata(&self, limit: Option<i64>, max_failures: i64) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT path FROM photo_metadata
                 WHERE (width IS NULL OR height IS NULL OR date_taken IS NULL)
                   AND metadata_status IN ('pending', 'failed_retry')
                   AND metadata_fail_count < ?
                 ORDER BY id
                 LIMIT {}",
                limit.unwrap_or(-1)
            );
            let mut stmt = conn.prepare(&sql)?;
            let paths = stmt
                .query_map([max_failures], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(paths)
        })
    }

    /// Record a successful extraction. Returns false when the path is
    /// unknown.
    pub fn mark_metadata_success(
        &self,
        path: &str,
        width: Option<i64>,
        height: Option<i64>,
        date_taken: Option<&str>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            // created_* follow date_taken; modified fallback comes from the row.
            let modified: Option<String> = conn
                .query_row(
                    "SELECT modified FROM photo_metadata WHERE path = ?",
                    [path],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            let (c_ts, c_date, c_year) =
                normalize_created_fields(date_taken, modified.as_deref());
            let changed = conn.execute(
                "UPDATE photo_metadata SET
                     width = COALESCE(?, width),
                     height = COALESCE(?, height),
                     date_taken = COALESCE(?, date_taken),
                     created_ts = COALESCE(?, created_ts),
                     created_date = COALESCE(?, created_date),
                     created_year = COALESCE(?, created_year),
                     metadata_status = 'ok',
                     metadata_fail_count = 0,
                     updated_at = ?
                 WHERE path = ?",
                params![width, height, date_taken, c_ts, c_date, c_year, now_string(), path],
            )?;
            Ok(changed > 0)
        })
    }

    /// Record a failed extraction. Rows flip to `failed_retry` and, once the
    /// counter reaches `max_retries`, to `failed`.
    pub fn mark_metadata_failure(
        &self,
        path: &str,
        error: Option<&str>,
        max_retries: i64,
    ) -> Result<bool> {
        if let Some(error) = error {
            tracing::debug!(path, error, "Metadata extraction failed");
        }
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE photo_metadata SET
                     metadata_fail_count = metadata_fail_count + 1,
                     metadata_status = CASE
                         WHEN metadata_fail_count + 1 >= ? THEN 'failed'
                         ELSE 'failed_retry'
                     END,
                     updated_at = ?
                 WHERE path = ?",
                params![max_retries, now_string(), path],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn reset_metadata_failures(&self, path: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE photo_metadata SET metadata_status = 'pending', metadata_fail_count = 0
                 WHERE path = ?",
                [path],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn metadata_stats(&self) -> Result<MetadataStats> {
        self.with_conn(|conn| {
            let mut stats = MetadataStats::default();
            let mut stmt = conn.prepare(
                "SELECT metadata_status, COUNT(*) FROM photo_metadata GROUP BY metadata_status",
            )?;
            let rows: Vec<(String, i64)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            for (status, count) in rows {
                stats.total += count;
                match status.as_str() {
                    metadata_status::OK => stats.ok = count,
                    metadata_status::PENDING => stats.pending = count,
                    metadata_status::FAILED_RETRY => stats.failed_retry = count,
                    metadata_status::FAILED => stats.failed = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
    }

    /// One-time maintenance pass after path normalization: rewrite legacy
    /// backslash paths, then drop duplicate rows keeping the lowest id per
    /// `(path, project_id)`. Idempotent.
    pub fn cleanup_duplicate_paths(&self) -> Result<usize> {
        self.with_tx(|tx| {
            // Drop rows that collapse onto the same normalized path first so
            // the rewrite below cannot trip the unique constraint.
            let removed = tx.execute(
                "DELETE FROM photo_metadata WHERE id NOT IN (
                     SELECT MIN(id) FROM photo_metadata
                     GROUP BY REPLACE(path, '\\', '/'), project_id
                 )",
                [],
            )?;
            tx.execute(
                "UPDATE photo_metadata SET path = REPLACE(path, '\\', '/')
                 WHERE path LIKE '%\\%'",
                [],
            )?;
            if removed > 0 {
                tracing::info!(removed, "Removed duplicate photo rows after path normalization");
            }
            Ok(removed)
        })
    }

    pub fn set_photo_hashes(
        &self,
        photo_id: i64,
        file_hash: Option<&str>,
        image_content_hash: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE photo_metadata SET
                     file_hash = COALESCE(?, file_hash),
                     image_content_hash = COALESCE(?, image_content_hash)
                 WHERE id = ?",
                params![file_hash, image_content_hash, photo_id],
            )?;
            Ok(())
        })
    }

    pub fn set_photo_gps(&self, photo_id: i64, lat: f64, lon: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE photo_metadata SET gps_latitude = ?, gps_longitude = ? WHERE id = ?",
                params![lat, lon, photo_id],
            )?;
            Ok(())
        })
    }

    /// User-editable fields (sidecar export reads these back).
    pub fn set_user_fields(
        &self,
        photo_id: i64,
        title: Option<&str>,
        caption: Option<&str>,
        rating: Option<i64>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE photo_metadata SET title = ?, caption = ?, rating = ?, updated_at = ?
                 WHERE id = ?",
                params![title, caption, rating, now_string(), photo_id],
            )?;
            Ok(())
        })
    }

    /// Photos without a file hash yet, for the lazy hashing workers.
    pub fn photos_missing_file_hash(
        &self,
        project_id: i64,
        limit: i64,
    ) -> Result<Vec<(i64, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path FROM photo_metadata
                 WHERE project_id = ? AND (file_hash IS NULL OR image_content_hash IS NULL)
                 ORDER BY id LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![project_id, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    pub fn distinct_created_dates(&self, project_id: i64) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT created_date FROM photo_metadata
                 WHERE project_id = ? AND created_date IS NOT NULL
                 ORDER BY created_date",
            )?;
            let dates = stmt
                .query_map([project_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(dates)
        })
    }

    pub fn image_paths_by_date(&self, project_id: i64, ymd: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT path FROM photo_metadata
                 WHERE project_id = ? AND created_date = ? ORDER BY created_ts, path",
            )?;
            let paths = stmt
                .query_map(params![project_id, ymd], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(paths)
        })
    }

    pub fn all_photo_paths(&self, project_id: i64) -> Result<Vec<(i64, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path FROM photo_metadata WHERE project_id = ? ORDER BY path",
            )?;
            let rows = stmt
                .query_map([project_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    pub fn delete_photos(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_tx(|tx| {
            let mut removed = 0;
            let mut stmt = tx.prepare("DELETE FROM photo_metadata WHERE id = ?")?;
            for id in ids {
                removed += stmt.execute([id])?;
            }
            Ok(removed)
        })
    }

    /// Rows needing the created_* backfill: nothing derived yet but a source
    /// field is present. The id cursor lets the backfill walk past rows
    /// whose dates never parse.
    pub fn backfill_candidates(
        &self,
        after_id: i64,
        chunk: i64,
    ) -> Result<Vec<(i64, Option<String>, Option<String>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, date_taken, modified FROM photo_metadata
                 WHERE id > ? AND created_ts IS NULL
                   AND (date_taken IS NOT NULL OR modified IS NOT NULL)
                 ORDER BY id LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![after_id, chunk], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    pub fn write_created_fields(
        &self,
        updates: &[(i64, Option<i64>, Option<String>, Option<i64>)],
    ) -> Result<usize> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE photo_metadata
                 SET created_ts = ?, created_date = ?, created_year = ?
                 WHERE id = ?",
            )?;
            let mut written = 0;
            for (id, ts, date, year) in updates {
                written += stmt.execute(params![ts, date, year, id])?;
            }
            Ok(written)
        })
    }

    /// Photos whose folder row is gone; reported by the integrity check.
    pub fn orphaned_photo_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM photo_metadata pm
                 LEFT JOIN photo_folders f ON f.id = pm.folder_id
                 WHERE f.id IS NULL",
                [],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{make_project, open_temp};
    use std::path::PathBuf;

    fn setup() -> (tempfile::TempDir, std::sync::Arc<CatalogDb>, i64, i64) {
        let (dir, db) = open_temp();
        let project = make_project(&db, "p");
        let folder = db.ensure_folder(project, "/lib", "lib", None).unwrap();
        (dir, db, project, folder)
    }

    #[test]
    fn test_normalize_created_fields_exif_format() {
        let (ts, date, year) = normalize_created_fields(Some("2024:03:10 11:00:00"), None);
        assert_eq!(date.as_deref(), Some("2024-03-10"));
        assert_eq!(year, Some(2024));
        assert!(ts.is_some());
    }

    #[test]
    fn test_normalize_created_fields_falls_back_to_modified() {
        let (_, date, year) = normalize_created_fields(Some("garbage"), Some("2023-07-01 09:30:00"));
        assert_eq!(date.as_deref(), Some("2023-07-01"));
        assert_eq!(year, Some(2023));
    }

    #[test]
    fn test_normalize_created_fields_unparseable_is_none() {
        let (ts, date, year) = normalize_created_fields(Some("not a date"), Some("also bad"));
        assert!(ts.is_none() && date.is_none() && year.is_none());
    }

    #[test]
    fn test_upsert_is_idempotent_and_preserves_updated_at() {
        let (_dir, db, project, folder) = setup();
        let path = PathBuf::from("/lib/img1.jpg");

        let id1 = db
            .upsert_photo(
                &path,
                folder,
                project,
                Some(120.5),
                Some("2024-03-10 11:00:00"),
                Some(1920),
                Some(1080),
                Some("2024:03:10 11:00:00"),
                &[],
            )
            .unwrap();
        let first = db.photo_by_id(id1).unwrap().unwrap();
        assert_eq!(first.metadata_status, "ok");
        assert_eq!(first.created_date.as_deref(), Some("2024-03-10"));
        assert_eq!(first.created_year, Some(2024));

        std::thread::sleep(std::time::Duration::from_millis(1100));
        let id2 = db
            .upsert_photo(
                &path,
                folder,
                project,
                Some(120.5),
                Some("2024-03-10 11:00:00"),
                Some(1920),
                Some(1080),
                Some("2024:03:10 11:00:00"),
                &[],
            )
            .unwrap();
        assert_eq!(id1, id2);

        let second = db.photo_by_id(id1).unwrap().unwrap();
        assert_eq!(second.updated_at, first.updated_at);
        assert_eq!(db.count_photos(project).unwrap(), 1);
    }

    #[test]
    fn test_upsert_bumps_updated_at_on_change() {
        let (_dir, db, project, folder) = setup();
        let path = PathBuf::from("/lib/img1.jpg");
        let id = db
            .upsert_photo(&path, folder, project, Some(100.0), None, None, None, None, &[])
            .unwrap();
        let first = db.photo_by_id(id).unwrap().unwrap();
        assert_eq!(first.metadata_status, "pending");

        std::thread::sleep(std::time::Duration::from_millis(1100));
        db.upsert_photo(&path, folder, project, Some(200.0), None, None, None, None, &[])
            .unwrap();
        let second = db.photo_by_id(id).unwrap().unwrap();
        assert_ne!(second.updated_at, first.updated_at);
        assert_eq!(second.size_kb, Some(200.0));
    }

    #[test]
    fn test_paths_are_normalized() {
        let (_dir, db, project, folder) = setup();
        let id = db
            .upsert_photo(
                &PathBuf::from("/lib/sub/img.jpg"),
                folder,
                project,
                None,
                None,
                None,
                None,
                None,
                &[],
            )
            .unwrap();
        let row = db.photo_by_id(id).unwrap().unwrap();
        assert!(!row.path.contains('\\'));
        assert!(row.path.starts_with('/'));
    }

    #[test]
    fn test_metadata_failure_threshold() {
        let (_dir, db, project, folder) = setup();
        let path = PathBuf::from("/lib/broken.jpg");
        db.upsert_photo(&path, folder, project, None, None, None, None, None, &[])
            .unwrap();
        let norm = normalize_media_path(&path);

        db.mark_metadata_failure(&norm, Some("decode error"), 3).unwrap();
        db.mark_metadata_failure(&norm, Some("decode error"), 3).unwrap();
        let row = db.photo_by_path(project, &path).unwrap().unwrap();
        assert_eq!(row.metadata_status, "failed_retry");
        assert_eq!(row.metadata_fail_count, 2);

        db.mark_metadata_failure(&norm, Some("decode error"), 3).unwrap();
        let row = db.photo_by_path(project, &path).unwrap().unwrap();
        assert_eq!(row.metadata_status, "failed");

        // Terminal rows no longer show up for the backfill worker.
        assert!(db.missing_metadata(None, 3).unwrap().is_empty());
    }

    #[test]
    fn test_missing_metadata_picks_up_pending_rows() {
        let (_dir, db, project, folder) = setup();
        db.upsert_photo(
            &PathBuf::from("/lib/no-meta.jpg"),
            folder,
            project,
            Some(10.0),
            None,
            None,
            None,
            None,
            &[],
        )
        .unwrap();
        db.upsert_photo(
            &PathBuf::from("/lib/with-meta.jpg"),
            folder,
            project,
            Some(10.0),
            None,
            Some(640),
            Some(480),
            Some("2024:01:01 00:00:00"),
            &[],
        )
        .unwrap();

        let missing = db.missing_metadata(None, 3).unwrap();
        assert_eq!(missing.len(), 1);
        assert!(missing[0].ends_with("no-meta.jpg"));
    }

    #[test]
    fn test_mark_success_recomputes_created_fields() {
        let (_dir, db, project, folder) = setup();
        let path = PathBuf::from("/lib/late.jpg");
        db.upsert_photo(&path, folder, project, None, None, None, None, None, &[])
            .unwrap();
        let norm = normalize_media_path(&path);
        db.mark_metadata_success(&norm, Some(800), Some(600), Some("2022:05:04 10:00:00"))
            .unwrap();
        let row = db.photo_by_path(project, &path).unwrap().unwrap();
        assert_eq!(row.metadata_status, "ok");
        assert_eq!(row.created_date.as_deref(), Some("2022-05-04"));
        assert_eq!(row.created_year, Some(2022));
    }

    #[test]
    fn test_cleanup_duplicate_paths() {
        let (_dir, db, project, folder) = setup();
        // Simulate legacy rows that normalized to the same path.
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO photo_metadata (path, folder_id, project_id) VALUES ('/lib/x.jpg', ?, ?)",
                params![folder, project],
            )?;
            // A backslash twin that cleanup must fold into the first row.
            conn.execute(
                "INSERT INTO photo_metadata (path, folder_id, project_id) VALUES ('\\lib\\x.jpg', ?, ?)",
                params![folder, project],
            )?;
            Ok(())
        })
        .unwrap();

        let removed = db.cleanup_duplicate_paths().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.count_photos(project).unwrap(), 1);
        // Second run is a no-op.
        assert_eq!(db.cleanup_duplicate_paths().unwrap(), 0);
    }
}
