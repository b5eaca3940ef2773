//! Projects, branches, and materialized branch membership.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::CatalogDb;

/// Branch key of the materialized "every photo of the project" branch.
pub const ALL_BRANCH: &str = "all";

/// Prefix for date branches: `by_date:YYYY-MM-DD`.
pub const DATE_BRANCH_PREFIX: &str = "by_date:";

#[derive(Debug, Clone)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub folder: String,
    pub semantic_model: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub id: i64,
    pub project_id: i64,
    pub branch_key: String,
    pub display_name: String,
}

impl CatalogDb {
    pub fn create_project(&self, name: &str, folder: &str, semantic_model: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (name, folder, semantic_model) VALUES (?, ?, ?)",
                params![name, folder, semantic_model],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_project(&self, project_id: i64) -> Result<Option<Project>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, folder, semantic_model, created_at FROM projects WHERE id = ?",
                    [project_id],
                    |row| {
                        Ok(Project {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            folder: row.get(2)?,
                            semantic_model: row.get(3)?,
                            created_at: row.get(4)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn all_projects(&self) -> Result<Vec<Project>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, folder, semantic_model, created_at FROM projects ORDER BY name",
            )?;
            let projects = stmt
                .query_map([], |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        folder: row.get(2)?,
                        semantic_model: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(projects)
        })
    }

    /// Cascades to every owned row through foreign keys.
    pub fn delete_project(&self, project_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM projects WHERE id = ?", [project_id])?;
            Ok(())
        })
    }

    /// Change the embedding model for a project. Existing embeddings keep
    /// their rows but become invisible to the new model key, so the next
    /// embedding pass recomputes everything.
    pub fn set_semantic_model(&self, project_id: i64, model: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE projects SET semantic_model = ? WHERE id = ?",
                params![model, project_id],
            )?;
            if changed > 0 {
                tracing::info!(project_id, model, "Semantic model changed; embeddings will be rebuilt");
            }
            Ok(())
        })
    }

    // ========================================================================
    // Branches
    // ========================================================================

    /// Insert the branch if missing and return its id.
    pub fn ensure_branch(
        &self,
        project_id: i64,
        branch_key: &str,
        display_name: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO branches (project_id, branch_key, display_name) VALUES (?, ?, ?)",
                params![project_id, branch_key, display_name],
            )?;
            let id = conn.query_row(
                "SELECT id FROM branches WHERE project_id = ? AND branch_key = ?",
                params![project_id, branch_key],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn ensure_all_branch(&self, project_id: i64) -> Result<i64> {
        self.ensure_branch(project_id, ALL_BRANCH, "All Photos")
    }

    pub fn branches(&self, project_id: i64) -> Result<Vec<Branch>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, branch_key, display_name
                 FROM branches WHERE project_id = ? ORDER BY branch_key",
            )?;
            let branches = stmt
                .query_map([project_id], |row| {
                    Ok(Branch {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        branch_key: row.get(2)?,
                        display_name: row.get(3)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(branches)
        })
    }

    pub fn rename_branch_display_name(
        &self,
        project_id: i64,
        branch_key: &str,
        new_name: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE branches SET display_name = ? WHERE project_id = ? AND branch_key = ?",
                params![new_name, project_id, branch_key],
            )?;
            Ok(())
        })
    }

    /// Remove a branch and everything attached to it: membership rows, face
    /// crops, and the rep row.
    pub fn delete_branch(&self, project_id: i64, branch_key: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM branches WHERE project_id = ? AND branch_key = ?",
                params![project_id, branch_key],
            )?;
            tx.execute(
                "DELETE FROM project_images WHERE project_id = ? AND branch_key = ?",
                params![project_id, branch_key],
            )?;
            tx.execute(
                "DELETE FROM face_crops WHERE project_id = ? AND branch_key = ?",
                params![project_id, branch_key],
            )?;
            tx.execute(
                "DELETE FROM face_branch_reps WHERE project_id = ? AND branch_key = ?",
                params![project_id, branch_key],
            )?;
            Ok(())
        })
    }

    // ========================================================================
    // Branch membership (project_images / project_videos)
    // ========================================================================

    pub fn add_project_image(
        &self,
        project_id: i64,
        branch_key: Option<&str>,
        image_path: &str,
        label: Option<&str>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO project_images (project_id, branch_key, image_path, label)
                 VALUES (?, ?, ?, ?)",
                params![project_id, branch_key, image_path, label],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn add_project_images_bulk(
        &self,
        project_id: i64,
        branch_key: &str,
        image_paths: &[String],
        label: Option<&str>,
    ) -> Result<usize> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO project_images (project_id, branch_key, image_path, label)
                 VALUES (?, ?, ?, ?)",
            )?;
            for path in image_paths {
                stmt.execute(params![project_id, branch_key, path, label])?;
            }
            Ok(image_paths.len())
        })
    }

    pub fn add_project_videos_bulk(
        &self,
        project_id: i64,
        branch_key: &str,
        video_paths: &[String],
    ) -> Result<usize> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO project_videos (project_id, branch_key, video_path) VALUES (?, ?, ?)",
            )?;
            for path in video_paths {
                stmt.execute(params![project_id, branch_key, path])?;
            }
            Ok(video_paths.len())
        })
    }

    pub fn images_by_branch(&self, project_id: i64, branch_key: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT image_path FROM project_images
                 WHERE project_id = ? AND branch_key = ? ORDER BY image_path",
            )?;
            let paths = stmt
                .query_map(params![project_id, branch_key], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(paths)
        })
    }

    pub fn count_images_by_branch(&self, project_id: i64, branch_key: &str) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM project_images WHERE project_id = ? AND branch_key = ?",
                params![project_id, branch_key],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::open_temp;

    #[test]
    fn test_project_crud() {
        let (_dir, db) = open_temp();
        let id = db.create_project("Family", "/photos/family", "clip-vit-b32").unwrap();
        let project = db.get_project(id).unwrap().unwrap();
        assert_eq!(project.name, "Family");
        assert_eq!(project.semantic_model, "clip-vit-b32");

        db.delete_project(id).unwrap();
        assert!(db.get_project(id).unwrap().is_none());
    }

    #[test]
    fn test_ensure_branch_is_idempotent() {
        let (_dir, db) = open_temp();
        let project = db.create_project("p", "/p", "m").unwrap();
        let a = db.ensure_branch(project, "by_date:2024-03-10", "2024-03-10").unwrap();
        let b = db.ensure_branch(project, "by_date:2024-03-10", "2024-03-10").unwrap();
        assert_eq!(a, b);
        assert_eq!(db.branches(project).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_project_cascades_membership() {
        let (_dir, db) = open_temp();
        let project = db.create_project("p", "/p", "m").unwrap();
        db.ensure_all_branch(project).unwrap();
        db.add_project_image(project, Some(ALL_BRANCH), "/p/a.jpg", None).unwrap();
        db.delete_project(project).unwrap();
        assert_eq!(db.count_images_by_branch(project, ALL_BRANCH).unwrap(), 0);
    }
}
