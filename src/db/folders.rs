//! Folder tree repository.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::CatalogDb;

#[derive(Debug, Clone)]
pub struct Folder {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub path: String,
    pub parent_id: Option<i64>,
    pub photo_count: i64,
}

fn folder_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Folder> {
    Ok(Folder {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        path: row.get(3)?,
        parent_id: row.get(4)?,
        photo_count: row.get(5)?,
    })
}

const FOLDER_COLS: &str = "id, project_id, name, path, parent_id, photo_count";

impl CatalogDb {
    /// Insert the folder if missing and return its id. Path is unique per
    /// project.
    pub fn ensure_folder(
        &self,
        project_id: i64,
        path: &str,
        name: &str,
        parent_id: Option<i64>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO photo_folders (project_id, name, path, parent_id)
                 VALUES (?, ?, ?, ?)",
                params![project_id, name, path, parent_id],
            )?;
            let id = conn.query_row(
                "SELECT id FROM photo_folders WHERE project_id = ? AND path = ?",
                params![project_id, path],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn folder_by_path(&self, project_id: i64, path: &str) -> Result<Option<Folder>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {FOLDER_COLS} FROM photo_folders WHERE project_id = ? AND path = ?"
                    ),
                    params![project_id, path],
                    folder_from_row,
                )
                .optional()?)
        })
    }

    pub fn folder_by_id(&self, folder_id: i64) -> Result<Option<Folder>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {FOLDER_COLS} FROM photo_folders WHERE id = ?"),
                    [folder_id],
                    folder_from_row,
                )
                .optional()?)
        })
    }

    /// Direct children of `parent_id`; `None` returns project roots.
    pub fn child_folders(&self, project_id: i64, parent_id: Option<i64>) -> Result<Vec<Folder>> {
        self.with_conn(|conn| {
            let folders = match parent_id {
                Some(parent) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {FOLDER_COLS} FROM photo_folders
                         WHERE project_id = ? AND parent_id = ? ORDER BY name"
                    ))?;
                    let rows = stmt
                        .query_map(params![project_id, parent], folder_from_row)?
                        .filter_map(|r| r.ok())
                        .collect();
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {FOLDER_COLS} FROM photo_folders
                         WHERE project_id = ? AND parent_id IS NULL ORDER BY name"
                    ))?;
                    let rows = stmt
                        .query_map([project_id], folder_from_row)?
                        .filter_map(|r| r.ok())
                        .collect();
                    rows
                }
            };
            Ok(folders)
        })
    }

    /// Ids of `folder_id` and every folder below it, via a recursive CTE.
    pub fn descendant_folder_ids(&self, project_id: i64, folder_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "WITH RECURSIVE subtree(id) AS (
                     SELECT id FROM photo_folders WHERE id = ? AND project_id = ?
                     UNION ALL
                     SELECT f.id FROM photo_folders f
                     JOIN subtree s ON f.parent_id = s.id
                 )
                 SELECT id FROM subtree",
            )?;
            let ids = stmt
                .query_map(params![folder_id, project_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(ids)
        })
    }

    /// Refresh the denormalized `photo_count` column for every folder of the
    /// project (direct photos only, not recursive).
    pub fn update_folder_counts(&self, project_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE photo_folders SET photo_count = (
                     SELECT COUNT(*) FROM photo_metadata pm
                     WHERE pm.folder_id = photo_folders.id AND pm.project_id = photo_folders.project_id
                 )
                 WHERE project_id = ?",
                [project_id],
            )?;
            Ok(())
        })
    }

    pub fn delete_folder(&self, folder_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM photo_folders WHERE id = ?", [folder_id])?;
            Ok(())
        })
    }
}
