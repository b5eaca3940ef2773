//! Media assets and instances: content identity separate from physical files.
//!
//! An asset is keyed by `(project_id, content_hash)`; every physical
//! occurrence of those bytes is an instance row. Duplicate listing counts
//! instances in a small derived table before joining the asset table, which
//! keeps the query flat even with hundreds of thousands of instances.

use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension};

use super::CatalogDb;
use crate::error::CatalogError;

#[derive(Debug, Clone)]
pub struct MediaAsset {
    pub asset_id: i64,
    pub project_id: i64,
    pub content_hash: String,
    pub representative_photo_id: Option<i64>,
    pub perceptual_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DuplicateAsset {
    pub asset_id: i64,
    pub content_hash: String,
    pub representative_photo_id: Option<i64>,
    pub perceptual_hash: Option<String>,
    pub instance_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceProvenance {
    pub source_device_id: Option<i64>,
    pub source_path: Option<String>,
    pub import_session_id: Option<i64>,
    pub file_size: Option<i64>,
}

impl CatalogDb {
    /// Create the asset row for a content hash if it does not exist yet;
    /// returns the asset id either way.
    pub fn ensure_asset(
        &self,
        project_id: i64,
        content_hash: &str,
        representative_photo_id: Option<i64>,
    ) -> Result<i64> {
        if let Some(photo_id) = representative_photo_id {
            let photo_project: Option<i64> = self.with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT project_id FROM photo_metadata WHERE id = ?",
                        [photo_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })?;
            if photo_project != Some(project_id) {
                bail!(CatalogError::CrossProject {
                    entity: "representative photo",
                    expected: project_id,
                    found: photo_project.unwrap_or(-1),
                });
            }
        }

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO media_asset (project_id, content_hash, representative_photo_id)
                 VALUES (?, ?, ?)",
                params![project_id, content_hash, representative_photo_id],
            )?;
            let id = conn.query_row(
                "SELECT asset_id FROM media_asset WHERE project_id = ? AND content_hash = ?",
                params![project_id, content_hash],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn asset_by_hash(&self, project_id: i64, content_hash: &str) -> Result<Option<MediaAsset>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT asset_id, project_id, content_hash, representative_photo_id, perceptual_hash
                     FROM media_asset WHERE project_id = ? AND content_hash = ?",
                    params![project_id, content_hash],
                    |row| {
                        Ok(MediaAsset {
                            asset_id: row.get(0)?,
                            project_id: row.get(1)?,
                            content_hash: row.get(2)?,
                            representative_photo_id: row.get(3)?,
                            perceptual_hash: row.get(4)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn set_asset_perceptual_hash(&self, asset_id: i64, perceptual_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE media_asset SET perceptual_hash = ? WHERE asset_id = ?",
                params![perceptual_hash, asset_id],
            )?;
            Ok(())
        })
    }

    /// Link a photo to an asset as one physical instance. Idempotent on
    /// `(project_id, photo_id)`. Both rows must belong to `project_id`.
    pub fn link_instance(
        &self,
        project_id: i64,
        asset_id: i64,
        photo_id: i64,
        provenance: &InstanceProvenance,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let asset_project: Option<i64> = conn
                .query_row(
                    "SELECT project_id FROM media_asset WHERE asset_id = ?",
                    [asset_id],
                    |row| row.get(0),
                )
                .optional()?;
            if asset_project != Some(project_id) {
                bail!(CatalogError::CrossProject {
                    entity: "asset",
                    expected: project_id,
                    found: asset_project.unwrap_or(-1),
                });
            }
            let photo_project: Option<i64> = conn
                .query_row(
                    "SELECT project_id FROM photo_metadata WHERE id = ?",
                    [photo_id],
                    |row| row.get(0),
                )
                .optional()?;
            if photo_project != Some(project_id) {
                bail!(CatalogError::CrossProject {
                    entity: "photo",
                    expected: project_id,
                    found: photo_project.unwrap_or(-1),
                });
            }

            conn.execute(
                "INSERT OR IGNORE INTO media_instance
                     (project_id, asset_id, photo_id, source_device_id, source_path,
                      import_session_id, file_size)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    project_id,
                    asset_id,
                    photo_id,
                    provenance.source_device_id,
                    provenance.source_path,
                    provenance.import_session_id,
                    provenance.file_size
                ],
            )?;
            Ok(())
        })
    }

    pub fn instance_count(&self, project_id: i64, asset_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM media_instance WHERE asset_id = ? AND project_id = ?",
                params![asset_id, project_id],
                |row| row.get(0),
            )?)
        })
    }

    /// Assets with at least `min_instances` physical occurrences, most
    /// duplicated first. Counts come from a derived table over the (smaller)
    /// instance index rather than a join-then-group over both tables.
    pub fn list_duplicates(
        &self,
        project_id: i64,
        min_instances: i64,
        limit: i64,
    ) -> Result<Vec<DuplicateAsset>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "WITH counts AS (
                     SELECT asset_id, COUNT(*) AS instance_count
                     FROM media_instance
                     WHERE project_id = ?
                     GROUP BY asset_id
                     HAVING COUNT(*) >= ?
                 )
                 SELECT a.asset_id, a.content_hash, a.representative_photo_id,
                        a.perceptual_hash, c.instance_count
                 FROM counts c
                 JOIN media_asset a ON a.asset_id = c.asset_id
                 ORDER BY c.instance_count DESC, a.asset_id
                 LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![project_id, min_instances, limit], |row| {
                    Ok(DuplicateAsset {
                        asset_id: row.get(0)?,
                        content_hash: row.get(1)?,
                        representative_photo_id: row.get(2)?,
                        perceptual_hash: row.get(3)?,
                        instance_count: row.get(4)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    /// Photo ids of all instances of an asset, lowest id first.
    pub fn instance_photo_ids(&self, project_id: i64, asset_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT photo_id FROM media_instance
                 WHERE asset_id = ? AND project_id = ? ORDER BY photo_id",
            )?;
            let ids = stmt
                .query_map(params![asset_id, project_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(ids)
        })
    }

    /// An asset with no instances is garbage; remove them all.
    pub fn delete_orphan_assets(&self, project_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM media_asset
                 WHERE project_id = ?
                   AND asset_id NOT IN (SELECT asset_id FROM media_instance WHERE project_id = ?)",
                params![project_id, project_id],
            )?;
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{make_project, open_temp};
    use std::path::PathBuf;

    fn add_photo(db: &CatalogDb, project: i64, name: &str) -> i64 {
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
    fn test_asset_identity_is_idempotent() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let photo = add_photo(&db, project, "a.jpg");

        let a = db.ensure_asset(project, "deadbeef", Some(photo)).unwrap();
        let b = db.ensure_asset(project, "deadbeef", Some(photo)).unwrap();
        assert_eq!(a, b);

        db.link_instance(project, a, photo, &InstanceProvenance::default())
            .unwrap();
        db.link_instance(project, a, photo, &InstanceProvenance::default())
            .unwrap();
        assert_eq!(db.instance_count(project, a).unwrap(), 1);
    }

    #[test]
    fn test_list_duplicates_counts_instances() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let p1 = add_photo(&db, project, "a/img.jpg");
        let p2 = add_photo(&db, project, "b/img.jpg");
        let p3 = add_photo(&db, project, "c/unique.jpg");

        let dup = db.ensure_asset(project, "same-bytes", Some(p1)).unwrap();
        db.link_instance(project, dup, p1, &InstanceProvenance::default())
            .unwrap();
        db.link_instance(project, dup, p2, &InstanceProvenance::default())
            .unwrap();

        let single = db.ensure_asset(project, "other-bytes", Some(p3)).unwrap();
        db.link_instance(project, single, p3, &InstanceProvenance::default())
            .unwrap();

        let dups = db.list_duplicates(project, 2, 100).unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].asset_id, dup);
        assert_eq!(dups[0].instance_count, 2);
    }

    #[test]
    fn test_cross_project_instance_rejected() {
        let (_dir, db) = open_temp();
        let p1 = make_project(&db, "p1");
        let p2 = make_project(&db, "p2");
        let photo = add_photo(&db, p2, "a.jpg");
        let asset = db.ensure_asset(p1, "hash", None).unwrap();

        assert!(db
            .link_instance(p1, asset, photo, &InstanceProvenance::default())
            .is_err());
    }

    #[test]
    fn test_orphan_assets_removed() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        db.ensure_asset(project, "lonely", None).unwrap();
        assert_eq!(db.delete_orphan_assets(project).unwrap(), 1);
    }
}
