//! Video metadata repository. Mirrors the photo side with a duration field.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::photos::{normalize_created_fields, normalize_media_path};
use super::CatalogDb;

#[derive(Debug, Clone, Default)]
pub struct VideoRow {
    pub id: i64,
    pub project_id: i64,
    pub folder_id: i64,
    pub path: String,
    pub size_kb: Option<f64>,
    pub modified: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration: Option<f64>,
    pub date_taken: Option<String>,
    pub file_hash: Option<String>,
    pub created_ts: Option<i64>,
    pub created_date: Option<String>,
    pub created_year: Option<i64>,
}

fn video_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VideoRow> {
    Ok(VideoRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        folder_id: row.get(2)?,
        path: row.get(3)?,
        size_kb: row.get(4)?,
        modified: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        duration: row.get(8)?,
        date_taken: row.get(9)?,
        file_hash: row.get(10)?,
        created_ts: row.get(11)?,
        created_date: row.get(12)?,
        created_year: row.get(13)?,
    })
}

const VIDEO_COLS: &str = "id, project_id, folder_id, path, size_kb, modified, width, height, \
                          duration, date_taken, file_hash, created_ts, created_date, created_year";

impl CatalogDb {
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_video(
        &self,
        path: &Path,
        folder_id: i64,
        project_id: i64,
        size_kb: Option<f64>,
        modified: Option<&str>,
        width: Option<i64>,
        height: Option<i64>,
        duration: Option<f64>,
        date_taken: Option<&str>,
    ) -> Result<i64> {
        let norm_path = normalize_media_path(path);
        let (c_ts, c_date, c_year) = normalize_created_fields(date_taken, modified);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO video_metadata
                     (path, folder_id, project_id, size_kb, modified, width, height, duration,
                      date_taken, updated_at, created_ts, created_date, created_year)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'), ?10, ?11, ?12)
                 ON CONFLICT(path, project_id) DO UPDATE SET
                     folder_id = excluded.folder_id,
                     size_kb = excluded.size_kb,
                     modified = excluded.modified,
                     width = excluded.width,
                     height = excluded.height,
                     duration = excluded.duration,
                     date_taken = excluded.date_taken,
                     updated_at = excluded.updated_at,
                     created_ts = COALESCE(excluded.created_ts, created_ts),
                     created_date = COALESCE(excluded.created_date, created_date),
                     created_year = COALESCE(excluded.created_year, created_year)
                 WHERE video_metadata.size_kb IS NOT excluded.size_kb
                    OR video_metadata.modified IS NOT excluded.modified
                    OR video_metadata.width IS NOT excluded.width
                    OR video_metadata.height IS NOT excluded.height
                    OR video_metadata.duration IS NOT excluded.duration
                    OR video_metadata.date_taken IS NOT excluded.date_taken
                    OR video_metadata.folder_id IS NOT excluded.folder_id",
                params![
                    norm_path, folder_id, project_id, size_kb, modified, width, height,
                    duration, date_taken, c_ts, c_date, c_year
                ],
            )?;
            let id = conn.query_row(
                "SELECT id FROM video_metadata WHERE path = ? AND project_id = ?",
                params![norm_path, project_id],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn video_by_path(&self, project_id: i64, path: &Path) -> Result<Option<VideoRow>> {
        let norm = normalize_media_path(path);
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {VIDEO_COLS} FROM video_metadata WHERE path = ? AND project_id = ?"
                    ),
                    params![norm, project_id],
                    video_from_row,
                )
                .optional()?)
        })
    }

    pub fn count_videos(&self, project_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM video_metadata WHERE project_id = ?",
                [project_id],
                |row| row.get(0),
            )?)
        })
    }

    pub fn distinct_video_created_dates(&self, project_id: i64) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT created_date FROM video_metadata
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

    pub fn video_paths_by_date(&self, project_id: i64, ymd: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT path FROM video_metadata
                 WHERE project_id = ? AND created_date = ? ORDER BY created_ts, path",
            )?;
            let paths = stmt
                .query_map(params![project_id, ymd], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(paths)
        })
    }

    pub fn all_video_paths(&self, project_id: i64) -> Result<Vec<(i64, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, path FROM video_metadata WHERE project_id = ? ORDER BY path")?;
            let rows = stmt
                .query_map([project_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    pub fn delete_videos(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_tx(|tx| {
            let mut removed = 0;
            let mut stmt = tx.prepare("DELETE FROM video_metadata WHERE id = ?")?;
            for id in ids {
                removed += stmt.execute([id])?;
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{make_project, open_temp};
    use std::path::PathBuf;

    #[test]
    fn test_video_upsert_idempotent() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let folder = db.ensure_folder(project, "/lib", "lib", None).unwrap();
        let path = PathBuf::from("/lib/clip.mp4");

        let a = db
            .upsert_video(
                &path,
                folder,
                project,
                Some(2048.0),
                Some("2024-06-01 12:00:00"),
                Some(1920),
                Some(1080),
                Some(12.5),
                None,
            )
            .unwrap();
        let b = db
            .upsert_video(
                &path,
                folder,
                project,
                Some(2048.0),
                Some("2024-06-01 12:00:00"),
                Some(1920),
                Some(1080),
                Some(12.5),
                None,
            )
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(db.count_videos(project).unwrap(), 1);

        let row = db.video_by_path(project, &path).unwrap().unwrap();
        assert_eq!(row.created_date.as_deref(), Some("2024-06-01"));
        assert_eq!(row.duration, Some(12.5));
    }
}
