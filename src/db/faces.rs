//! Face crops, cluster reps, and merge history rows.

use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension};

use super::embeddings::{bytes_to_embedding, embedding_to_bytes};
use super::CatalogDb;
use crate::error::CatalogError;

/// Bounding box of a detected face within its source photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub id: i64,
    pub project_id: i64,
    pub branch_key: String,
    pub image_path: String,
    pub crop_path: String,
    pub bbox: BoundingBox,
    pub embedding: Option<Vec<f32>>,
    pub quality_score: Option<f64>,
    pub is_representative: bool,
}

/// Input row for bulk crop insertion.
#[derive(Debug, Clone)]
pub struct NewFaceCrop {
    pub branch_key: String,
    pub image_path: String,
    pub crop_path: String,
    pub bbox: BoundingBox,
    pub embedding: Option<Vec<f32>>,
    pub quality_score: Option<f64>,
    pub is_representative: bool,
}

#[derive(Debug, Clone)]
pub struct FaceBranchRep {
    pub project_id: i64,
    pub branch_key: String,
    pub label: Option<String>,
    pub count: i64,
    pub centroid: Option<Vec<f32>>,
    pub rep_path: Option<String>,
    pub rep_thumb_png: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct MergeHistoryRow {
    pub id: i64,
    pub project_id: i64,
    pub target_branch: String,
    pub source_branches: Vec<String>,
    pub snapshot: String,
    pub created_at: String,
}

impl CatalogDb {
    /// Bulk-insert face crops, idempotent on `(project_id, branch_key,
    /// crop_path)`. Rows with a degenerate bbox are rejected before anything
    /// is written.
    pub fn add_face_crops_bulk(&self, project_id: i64, crops: &[NewFaceCrop]) -> Result<usize> {
        for crop in crops {
            if crop.bbox.width <= 0 || crop.bbox.height <= 0 {
                bail!(CatalogError::InvalidBbox {
                    image_path: crop.image_path.clone(),
                    x: crop.bbox.x,
                    y: crop.bbox.y,
                    w: crop.bbox.width,
                    h: crop.bbox.height,
                });
            }
        }

        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO face_crops
                     (project_id, branch_key, image_path, crop_path,
                      bbox_x, bbox_y, bbox_w, bbox_h,
                      embedding, quality_score, is_representative)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            let mut added = 0;
            for crop in crops {
                let embedding_bytes = crop.embedding.as_deref().map(embedding_to_bytes);
                added += stmt.execute(params![
                    project_id,
                    crop.branch_key,
                    crop.image_path,
                    crop.crop_path,
                    crop.bbox.x,
                    crop.bbox.y,
                    crop.bbox.width,
                    crop.bbox.height,
                    embedding_bytes,
                    crop.quality_score,
                    crop.is_representative as i64,
                ])?;
            }
            Ok(added)
        })
    }

    pub fn face_crops_for_branch(&self, project_id: i64, branch_key: &str) -> Result<Vec<FaceCrop>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, branch_key, image_path, crop_path,
                        bbox_x, bbox_y, bbox_w, bbox_h,
                        embedding, quality_score, is_representative
                 FROM face_crops
                 WHERE project_id = ? AND branch_key = ?
                 ORDER BY id",
            )?;
            let crops = stmt
                .query_map(params![project_id, branch_key], face_crop_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(crops)
        })
    }

    /// Per-branch member count and rep path, largest clusters first.
    pub fn face_branch_summary(
        &self,
        project_id: i64,
    ) -> Result<Vec<(String, i64, Option<String>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT fc.branch_key, COUNT(*) AS member_count, r.rep_path
                 FROM face_crops fc
                 LEFT JOIN face_branch_reps r
                   ON r.project_id = fc.project_id AND r.branch_key = fc.branch_key
                 WHERE fc.project_id = ?
                 GROUP BY fc.branch_key
                 ORDER BY member_count DESC, fc.branch_key",
            )?;
            let rows = stmt
                .query_map([project_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    /// Crops whose `image_path` points inside the crops directory. Those
    /// rows reference derived files instead of originals and are flagged as
    /// invalid data by the quality dashboard.
    pub fn invalid_face_crops(&self, project_id: i64, crops_dir: &str) -> Result<Vec<FaceCrop>> {
        let prefix = format!("{}%", crops_dir.trim_end_matches('/').to_owned() + "/");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, branch_key, image_path, crop_path,
                        bbox_x, bbox_y, bbox_w, bbox_h,
                        embedding, quality_score, is_representative
                 FROM face_crops
                 WHERE project_id = ? AND image_path LIKE ?
                 ORDER BY id",
            )?;
            let crops = stmt
                .query_map(params![project_id, prefix], face_crop_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(crops)
        })
    }

    pub fn upsert_face_branch_rep(
        &self,
        project_id: i64,
        branch_key: &str,
        label: Option<&str>,
        count: i64,
        centroid: Option<&[f32]>,
        rep_path: Option<&str>,
        rep_thumb_png: Option<&[u8]>,
    ) -> Result<()> {
        let centroid_bytes = centroid.map(embedding_to_bytes);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO face_branch_reps
                     (project_id, branch_key, label, count, centroid, rep_path, rep_thumb_png)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(project_id, branch_key) DO UPDATE SET
                     label = excluded.label,
                     count = excluded.count,
                     centroid = excluded.centroid,
                     rep_path = excluded.rep_path,
                     rep_thumb_png = excluded.rep_thumb_png",
                params![
                    project_id,
                    branch_key,
                    label,
                    count,
                    centroid_bytes,
                    rep_path,
                    rep_thumb_png
                ],
            )?;
            Ok(())
        })
    }

    pub fn face_branch_reps(&self, project_id: i64) -> Result<Vec<FaceBranchRep>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT project_id, branch_key, label, count, centroid, rep_path, rep_thumb_png
                 FROM face_branch_reps WHERE project_id = ? ORDER BY branch_key",
            )?;
            let reps = stmt
                .query_map([project_id], |row| {
                    let centroid_bytes: Option<Vec<u8>> = row.get(4)?;
                    Ok(FaceBranchRep {
                        project_id: row.get(0)?,
                        branch_key: row.get(1)?,
                        label: row.get(2)?,
                        count: row.get(3)?,
                        centroid: centroid_bytes.map(|b| bytes_to_embedding(&b)),
                        rep_path: row.get(5)?,
                        rep_thumb_png: row.get(6)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(reps)
        })
    }

    pub fn face_branch_rep(
        &self,
        project_id: i64,
        branch_key: &str,
    ) -> Result<Option<FaceBranchRep>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT project_id, branch_key, label, count, centroid, rep_path, rep_thumb_png
                     FROM face_branch_reps WHERE project_id = ? AND branch_key = ?",
                    params![project_id, branch_key],
                    |row| {
                        let centroid_bytes: Option<Vec<u8>> = row.get(4)?;
                        Ok(FaceBranchRep {
                            project_id: row.get(0)?,
                            branch_key: row.get(1)?,
                            label: row.get(2)?,
                            count: row.get(3)?,
                            centroid: centroid_bytes.map(|b| bytes_to_embedding(&b)),
                            rep_path: row.get(5)?,
                            rep_thumb_png: row.get(6)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Remove all face data for a clean rebuild: crops, reps, and the
    /// face branches themselves.
    pub fn reset_face_data(&self, project_id: i64) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM face_crops WHERE project_id = ?", [project_id])?;
            tx.execute(
                "DELETE FROM face_branch_reps WHERE project_id = ?",
                [project_id],
            )?;
            tx.execute(
                "DELETE FROM branches WHERE project_id = ? AND branch_key LIKE 'face_%'",
                [project_id],
            )?;
            tx.execute(
                "DELETE FROM project_images WHERE project_id = ? AND branch_key LIKE 'face_%'",
                [project_id],
            )?;
            tracing::info!(project_id, "Reset face data for project");
            Ok(())
        })
    }

    // ========================================================================
    // Merge history
    // ========================================================================

    pub fn latest_merge_history(&self, project_id: i64) -> Result<Option<MergeHistoryRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, project_id, target_branch, source_branches, snapshot, created_at
                     FROM face_merge_history
                     WHERE project_id = ?
                     ORDER BY id DESC LIMIT 1",
                    [project_id],
                    |row| {
                        let sources: String = row.get(3)?;
                        Ok(MergeHistoryRow {
                            id: row.get(0)?,
                            project_id: row.get(1)?,
                            target_branch: row.get(2)?,
                            source_branches: serde_json::from_str(&sources).unwrap_or_default(),
                            snapshot: row.get(4)?,
                            created_at: row.get(5)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn merge_history_count(&self, project_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM face_merge_history WHERE project_id = ?",
                [project_id],
                |row| row.get(0),
            )?)
        })
    }
}

fn face_crop_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FaceCrop> {
    let embedding_bytes: Option<Vec<u8>> = row.get(9)?;
    Ok(FaceCrop {
        id: row.get(0)?,
        project_id: row.get(1)?,
        branch_key: row.get(2)?,
        image_path: row.get(3)?,
        crop_path: row.get(4)?,
        bbox: BoundingBox {
            x: row.get(5)?,
            y: row.get(6)?,
            width: row.get(7)?,
            height: row.get(8)?,
        },
        embedding: embedding_bytes.map(|b| bytes_to_embedding(&b)),
        quality_score: row.get(10)?,
        is_representative: row.get::<_, i64>(11)? != 0,
    })
}
