//! Tag repository.
//!
//! Tags are unique per `(project_id, name)` with `COLLATE NOCASE` name
//! comparison. Every assignment validates that the tag and the photo belong
//! to the same project; violations abort rather than silently cross-link.

use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension};

use super::CatalogDb;
use crate::error::CatalogError;

/// SQLite's default variable limit is 999; stay well below it.
const CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct Tag {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
}

impl CatalogDb {
    pub fn create_tag(&self, name: &str, project_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tags (name, project_id) VALUES (?, ?)",
                params![name, project_id],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn tag_by_name(&self, name: &str, project_id: i64) -> Result<Option<Tag>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, project_id, name FROM tags
                     WHERE project_id = ? AND name = ? COLLATE NOCASE",
                    params![project_id, name],
                    |row| {
                        Ok(Tag {
                            id: row.get(0)?,
                            project_id: row.get(1)?,
                            name: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Find the tag case-insensitively or create it.
    pub fn ensure_tag(&self, name: &str, project_id: i64) -> Result<i64> {
        if let Some(tag) = self.tag_by_name(name, project_id)? {
            return Ok(tag.id);
        }
        self.create_tag(name, project_id)
    }

    /// Rename a tag. When the target name already exists (case-insensitive),
    /// the two are merged: assignments move to the surviving tag and the old
    /// row is deleted. Returns false when `old` does not exist.
    pub fn rename_tag(&self, old: &str, new: &str, project_id: i64) -> Result<bool> {
        let Some(source) = self.tag_by_name(old, project_id)? else {
            return Ok(false);
        };

        let target = self.tag_by_name(new, project_id)?;
        self.with_tx(|tx| {
            match target {
                Some(target) if target.id != source.id => {
                    // Merge: move assignments, dropping any that already exist
                    // on the target, then delete the source tag.
                    tx.execute(
                        "INSERT OR IGNORE INTO photo_tags (photo_id, tag_id)
                         SELECT photo_id, ? FROM photo_tags WHERE tag_id = ?",
                        params![target.id, source.id],
                    )?;
                    tx.execute(
                        "INSERT OR IGNORE INTO video_tags (video_id, tag_id)
                         SELECT video_id, ? FROM video_tags WHERE tag_id = ?",
                        params![target.id, source.id],
                    )?;
                    tx.execute("DELETE FROM tags WHERE id = ?", [source.id])?;
                    tracing::info!(old, new, project_id, "Merged tag into existing name");
                }
                _ => {
                    tx.execute(
                        "UPDATE tags SET name = ? WHERE id = ?",
                        params![new, source.id],
                    )?;
                }
            }
            Ok(true)
        })
    }

    pub fn delete_tag(&self, tag_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM tags WHERE id = ?", [tag_id])?;
            Ok(removed > 0)
        })
    }

    fn check_same_project(&self, photo_id: i64, tag_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let photo_project: Option<i64> = conn
                .query_row(
                    "SELECT project_id FROM photo_metadata WHERE id = ?",
                    [photo_id],
                    |row| row.get(0),
                )
                .optional()?;
            let tag_project: Option<i64> = conn
                .query_row("SELECT project_id FROM tags WHERE id = ?", [tag_id], |row| {
                    row.get(0)
                })
                .optional()?;

            let Some(photo_project) = photo_project else {
                bail!(CatalogError::NotFound {
                    entity: "photo",
                    key: photo_id.to_string(),
                });
            };
            let Some(tag_project) = tag_project else {
                bail!(CatalogError::NotFound {
                    entity: "tag",
                    key: tag_id.to_string(),
                });
            };
            if photo_project != tag_project {
                bail!(CatalogError::CrossProject {
                    entity: "tag",
                    expected: photo_project,
                    found: tag_project,
                });
            }
            Ok(())
        })
    }

    pub fn add_tag_to_photo(&self, photo_id: i64, tag_id: i64) -> Result<()> {
        self.check_same_project(photo_id, tag_id)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO photo_tags (photo_id, tag_id) VALUES (?, ?)",
                params![photo_id, tag_id],
            )?;
            Ok(())
        })
    }

    pub fn remove_tag_from_photo(&self, photo_id: i64, tag_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM photo_tags WHERE photo_id = ? AND tag_id = ?",
                params![photo_id, tag_id],
            )?;
            Ok(())
        })
    }

    pub fn add_tag_to_video(&self, video_id: i64, tag_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let video_project: Option<i64> = conn
                .query_row(
                    "SELECT project_id FROM video_metadata WHERE id = ?",
                    [video_id],
                    |row| row.get(0),
                )
                .optional()?;
            let tag_project: Option<i64> = conn
                .query_row("SELECT project_id FROM tags WHERE id = ?", [tag_id], |row| {
                    row.get(0)
                })
                .optional()?;
            match (video_project, tag_project) {
                (Some(v), Some(t)) if v == t => {}
                (Some(v), t) => bail!(CatalogError::CrossProject {
                    entity: "tag",
                    expected: v,
                    found: t.unwrap_or(-1),
                }),
                (None, _) => bail!(CatalogError::NotFound {
                    entity: "video",
                    key: video_id.to_string(),
                }),
            }
            conn.execute(
                "INSERT OR IGNORE INTO video_tags (video_id, tag_id) VALUES (?, ?)",
                params![video_id, tag_id],
            )?;
            Ok(())
        })
    }

    pub fn remove_tag_from_video(&self, video_id: i64, tag_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM video_tags WHERE video_id = ? AND tag_id = ?",
                params![video_id, tag_id],
            )?;
            Ok(())
        })
    }

    /// Bulk-assign one tag to many photos. Chunked to stay under the
    /// engine's variable limit; every chunk re-validates project membership.
    pub fn add_tag_to_photos_bulk(&self, photo_ids: &[i64], tag_id: i64) -> Result<usize> {
        if photo_ids.is_empty() {
            return Ok(0);
        }
        let tag_project: i64 = self.with_conn(|conn| {
            conn.query_row("SELECT project_id FROM tags WHERE id = ?", [tag_id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| {
                anyhow::anyhow!(CatalogError::NotFound {
                    entity: "tag",
                    key: tag_id.to_string(),
                })
            })
        })?;

        self.with_tx(|tx| {
            let mut added = 0;
            for chunk in photo_ids.chunks(CHUNK_SIZE) {
                let placeholders = vec!["?"; chunk.len()].join(",");
                let params_vec: Vec<&dyn rusqlite::ToSql> =
                    chunk.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

                let in_project: i64 = tx.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM photo_metadata
                         WHERE project_id = {tag_project} AND id IN ({placeholders})"
                    ),
                    params_vec.as_slice(),
                    |row| row.get(0),
                )?;
                if in_project as usize != chunk.len() {
                    bail!(CatalogError::CrossProject {
                        entity: "photo batch",
                        expected: tag_project,
                        found: -1,
                    });
                }

                added += tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO photo_tags (photo_id, tag_id)
                         SELECT id, {tag_id} FROM photo_metadata WHERE id IN ({placeholders})"
                    ),
                    params_vec.as_slice(),
                )?;
            }
            Ok(added)
        })
    }

    pub fn remove_tag_from_photos_bulk(&self, photo_ids: &[i64], tag_id: i64) -> Result<usize> {
        if photo_ids.is_empty() {
            return Ok(0);
        }
        self.with_tx(|tx| {
            let mut removed = 0;
            for chunk in photo_ids.chunks(CHUNK_SIZE) {
                let placeholders = vec!["?"; chunk.len()].join(",");
                let params_vec: Vec<&dyn rusqlite::ToSql> =
                    chunk.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
                removed += tx.execute(
                    &format!(
                        "DELETE FROM photo_tags WHERE tag_id = {tag_id} AND photo_id IN ({placeholders})"
                    ),
                    params_vec.as_slice(),
                )?;
            }
            Ok(removed)
        })
    }

    pub fn tags_for_photo(&self, photo_id: i64) -> Result<Vec<Tag>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id, t.project_id, t.name
                 FROM tags t
                 JOIN photo_tags pt ON pt.tag_id = t.id
                 WHERE pt.photo_id = ?
                 ORDER BY t.name COLLATE NOCASE",
            )?;
            let tags = stmt
                .query_map([photo_id], |row| {
                    Ok(Tag {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        name: row.get(2)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(tags)
        })
    }

    pub fn all_tags_with_counts(&self, project_id: i64) -> Result<Vec<(String, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.name, COUNT(pt.photo_id)
                 FROM tags t
                 LEFT JOIN photo_tags pt ON pt.tag_id = t.id
                 WHERE t.project_id = ?
                 GROUP BY t.id
                 ORDER BY t.name COLLATE NOCASE",
            )?;
            let rows = stmt
                .query_map([project_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    /// Photo ids carrying a tag, resolved case-insensitively by name.
    pub fn photos_by_tag(&self, tag_name: &str, project_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT pt.photo_id
                 FROM photo_tags pt
                 JOIN tags t ON t.id = pt.tag_id
                 WHERE t.project_id = ? AND t.name = ? COLLATE NOCASE
                 ORDER BY pt.photo_id",
            )?;
            let ids = stmt
                .query_map(params![project_id, tag_name], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{make_project, open_temp};
    use std::path::PathBuf;

    fn setup_photo(db: &CatalogDb, project: i64, name: &str) -> i64 {
        let folder = db.ensure_folder(project, "/lib", "lib", None).unwrap();
        db.upsert_photo(
            &PathBuf::from(format!("/lib/{name}")),
            folder,
            project,
            None,
            None,
            None,
            None,
            None,
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_ensure_tag_case_insensitive() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let a = db.ensure_tag("Holiday", project).unwrap();
        let b = db.ensure_tag("holiday", project).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_cross_project_assignment_rejected() {
        let (_dir, db) = open_temp();
        let p1 = make_project(&db, "p1");
        let p2 = make_project(&db, "p2");
        let photo = setup_photo(&db, p1, "a.jpg");
        let foreign_tag = db.ensure_tag("dog", p2).unwrap();

        let err = db.add_tag_to_photo(photo, foreign_tag).unwrap_err();
        assert!(err.to_string().contains("cross-project"));
    }

    #[test]
    fn test_rename_merges_into_existing_tag() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let photo_a = setup_photo(&db, project, "a.jpg");
        let photo_b = setup_photo(&db, project, "b.jpg");

        let dog = db.create_tag("Dog", project).unwrap();
        let hound = db.create_tag("Hound", project).unwrap();
        db.add_tag_to_photo(photo_a, dog).unwrap();
        db.add_tag_to_photo(photo_b, dog).unwrap();
        db.add_tag_to_photo(photo_b, hound).unwrap();

        // photo_b carries both tags; the merge must not duplicate it.
        assert!(db.rename_tag("Dog", "hound", project).unwrap());
        assert!(db.tag_by_name("Dog", project).unwrap().is_none());
        let ids = db.photos_by_tag("hound", project).unwrap();
        assert_eq!(ids, vec![photo_a, photo_b]);
    }

    #[test]
    fn test_bulk_add_and_remove() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let photos: Vec<i64> = (0..10)
            .map(|i| setup_photo(&db, project, &format!("{i}.jpg")))
            .collect();
        let tag = db.ensure_tag("batch", project).unwrap();

        let added = db.add_tag_to_photos_bulk(&photos, tag).unwrap();
        assert_eq!(added, 10);
        // Second call is a no-op.
        assert_eq!(db.add_tag_to_photos_bulk(&photos, tag).unwrap(), 0);

        let removed = db.remove_tag_from_photos_bulk(&photos[..5], tag).unwrap();
        assert_eq!(removed, 5);
        assert_eq!(db.photos_by_tag("batch", project).unwrap().len(), 5);
    }
}
