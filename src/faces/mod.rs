//! Face cluster lifecycle: merge with reversible snapshot, undo, and
//! centroid-based merge suggestions.
//!
//! A merge snapshots every affected row into `face_merge_history` as one
//! JSON payload (binary columns base64-encoded), then moves crops and
//! branch membership, all inside a single transaction. Undo is the sole
//! consumer of the snapshot and restores rows in reverse dependency order.

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::CatalogDb;

const SNAPSHOT_VERSION: u32 = 1;

/// Default ceiling for centroid distance between clusters suggested for
/// merging.
pub const SUGGESTION_THRESHOLD: f32 = 0.45;
/// Clusters smaller than this are too noisy to suggest.
pub const SUGGESTION_MIN_COUNT: i64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BranchSnap {
    id: i64,
    branch_key: String,
    display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepSnap {
    branch_key: String,
    label: Option<String>,
    count: i64,
    centroid_b64: Option<String>,
    rep_path: Option<String>,
    rep_thumb_png_b64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CropSnap {
    id: i64,
    branch_key: String,
    image_path: String,
    crop_path: String,
    bbox: (i64, i64, i64, i64),
    embedding_b64: Option<String>,
    quality_score: Option<f64>,
    is_representative: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageSnap {
    id: i64,
    branch_key: Option<String>,
    image_path: String,
    label: Option<String>,
}

/// Pre-merge state of every row under the affected branch keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MergeSnapshot {
    version: u32,
    branches: Vec<BranchSnap>,
    reps: Vec<RepSnap>,
    crops: Vec<CropSnap>,
    project_images: Vec<ImageSnap>,
}

/// A pair of clusters whose centroids sit close together.
#[derive(Debug, Clone)]
pub struct MergeSuggestion {
    pub branch_a: String,
    pub branch_b: String,
    pub distance: f32,
    pub count_a: i64,
    pub count_b: i64,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub history_id: i64,
    pub moved_crops: usize,
    pub target_count: i64,
}

pub struct FaceClusterService {
    db: Arc<CatalogDb>,
}

impl FaceClusterService {
    pub fn new(db: Arc<CatalogDb>) -> Self {
        Self { db }
    }

    /// Merge `source_branches` into `target_branch`. The pre-merge state of
    /// every affected branch is snapshotted first; observers see either the
    /// old or the new clustering, never an in-between state.
    pub fn merge(
        &self,
        project_id: i64,
        target_branch: &str,
        source_branches: &[String],
    ) -> Result<MergeOutcome> {
        if source_branches.is_empty() {
            bail!("merge needs at least one source branch");
        }
        if source_branches.iter().any(|s| s == target_branch) {
            bail!("target branch cannot be one of the sources");
        }

        let mut affected: Vec<String> = source_branches.to_vec();
        affected.push(target_branch.to_string());

        self.db.with_tx(|tx| {
            let snapshot = take_snapshot(tx, project_id, &affected)?;
            let snapshot_json = serde_json::to_string(&snapshot)?;
            tx.execute(
                "INSERT INTO face_merge_history (project_id, target_branch, source_branches, snapshot)
                 VALUES (?, ?, ?, ?)",
                params![
                    project_id,
                    target_branch,
                    serde_json::to_string(source_branches)?,
                    snapshot_json
                ],
            )?;
            let history_id = tx.last_insert_rowid();

            let mut moved_crops = 0usize;
            for source in source_branches {
                moved_crops += tx.execute(
                    "UPDATE face_crops SET branch_key = ? WHERE project_id = ? AND branch_key = ?",
                    params![target_branch, project_id, source],
                )?;
                tx.execute(
                    "UPDATE project_images SET branch_key = ? WHERE project_id = ? AND branch_key = ?",
                    params![target_branch, project_id, source],
                )?;
                tx.execute(
                    "DELETE FROM face_branch_reps WHERE project_id = ? AND branch_key = ?",
                    params![project_id, source],
                )?;
                tx.execute(
                    "DELETE FROM branches WHERE project_id = ? AND branch_key = ?",
                    params![project_id, source],
                )?;
            }

            tx.execute(
                "UPDATE face_branch_reps SET count = (
                     SELECT COUNT(*) FROM face_crops
                     WHERE project_id = ?1 AND branch_key = ?2
                 )
                 WHERE project_id = ?1 AND branch_key = ?2",
                params![project_id, target_branch],
            )?;
            let target_count: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM face_crops WHERE project_id = ? AND branch_key = ?",
                    params![project_id, target_branch],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);

            tracing::info!(
                project_id,
                target_branch,
                moved_crops,
                target_count,
                "Merged face branches"
            );
            Ok(MergeOutcome {
                history_id,
                moved_crops,
                target_count,
            })
        })
    }

    /// Undo the most recent merge of the project. Restores the snapshot in
    /// reverse dependency order and removes the history row. Returns false
    /// when there is nothing to undo.
    pub fn undo_last(&self, project_id: i64) -> Result<bool> {
        let Some(history) = self.db.latest_merge_history(project_id)? else {
            return Ok(false);
        };
        let snapshot: MergeSnapshot = serde_json::from_str(&history.snapshot)?;
        if snapshot.version != SNAPSHOT_VERSION {
            bail!(
                "unsupported merge snapshot version {} (expected {})",
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }

        let mut affected = history.source_branches.clone();
        affected.push(history.target_branch.clone());

        self.db.with_tx(|tx| {
            // Drop current state under the affected keys.
            for key in &affected {
                tx.execute(
                    "DELETE FROM face_crops WHERE project_id = ? AND branch_key = ?",
                    params![project_id, key],
                )?;
                tx.execute(
                    "DELETE FROM project_images WHERE project_id = ? AND branch_key = ?",
                    params![project_id, key],
                )?;
                tx.execute(
                    "DELETE FROM face_branch_reps WHERE project_id = ? AND branch_key = ?",
                    params![project_id, key],
                )?;
                tx.execute(
                    "DELETE FROM branches WHERE project_id = ? AND branch_key = ?",
                    params![project_id, key],
                )?;
            }

            // Reinsert from the snapshot, parents before children.
            for branch in &snapshot.branches {
                tx.execute(
                    "INSERT INTO branches (id, project_id, branch_key, display_name)
                     VALUES (?, ?, ?, ?)",
                    params![branch.id, project_id, branch.branch_key, branch.display_name],
                )?;
            }
            for rep in &snapshot.reps {
                let centroid = rep
                    .centroid_b64
                    .as_deref()
                    .map(|b| BASE64.decode(b))
                    .transpose()?;
                let thumb = rep
                    .rep_thumb_png_b64
                    .as_deref()
                    .map(|b| BASE64.decode(b))
                    .transpose()?;
                tx.execute(
                    "INSERT INTO face_branch_reps
                         (project_id, branch_key, label, count, centroid, rep_path, rep_thumb_png)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        project_id,
                        rep.branch_key,
                        rep.label,
                        rep.count,
                        centroid,
                        rep.rep_path,
                        thumb
                    ],
                )?;
            }
            for crop in &snapshot.crops {
                let embedding = crop
                    .embedding_b64
                    .as_deref()
                    .map(|b| BASE64.decode(b))
                    .transpose()?;
                tx.execute(
                    "INSERT INTO face_crops
                         (id, project_id, branch_key, image_path, crop_path,
                          bbox_x, bbox_y, bbox_w, bbox_h,
                          embedding, quality_score, is_representative)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        crop.id,
                        project_id,
                        crop.branch_key,
                        crop.image_path,
                        crop.crop_path,
                        crop.bbox.0,
                        crop.bbox.1,
                        crop.bbox.2,
                        crop.bbox.3,
                        embedding,
                        crop.quality_score,
                        crop.is_representative as i64,
                    ],
                )?;
            }
            for image in &snapshot.project_images {
                tx.execute(
                    "INSERT INTO project_images (id, project_id, branch_key, image_path, label)
                     VALUES (?, ?, ?, ?, ?)",
                    params![image.id, project_id, image.branch_key, image.image_path, image.label],
                )?;
            }

            tx.execute("DELETE FROM face_merge_history WHERE id = ?", [history.id])?;
            tracing::info!(project_id, history_id = history.id, "Undid face merge");
            Ok(true)
        })
    }

    /// Cluster pairs whose centroids lie within `threshold` (Euclidean),
    /// closest pairs first, limited to `max_pairs`. Clusters below
    /// `min_count` or without a centroid are ignored.
    pub fn merge_suggestions(
        &self,
        project_id: i64,
        threshold: f32,
        min_count: i64,
        max_pairs: usize,
    ) -> Result<Vec<MergeSuggestion>> {
        let reps: Vec<_> = self
            .db
            .face_branch_reps(project_id)?
            .into_iter()
            .filter(|r| r.count >= min_count && r.centroid.is_some())
            .collect();

        let mut suggestions = Vec::new();
        for i in 0..reps.len() {
            for j in (i + 1)..reps.len() {
                let a = reps[i].centroid.as_ref().unwrap();
                let b = reps[j].centroid.as_ref().unwrap();
                if a.len() != b.len() {
                    continue;
                }
                let distance = euclidean_distance(a, b);
                if distance <= threshold {
                    suggestions.push(MergeSuggestion {
                        branch_a: reps[i].branch_key.clone(),
                        branch_b: reps[j].branch_key.clone(),
                        distance,
                        count_a: reps[i].count,
                        count_b: reps[j].count,
                    });
                }
            }
        }

        suggestions.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        suggestions.truncate(max_pairs);
        Ok(suggestions)
    }
}

fn take_snapshot(tx: &Transaction, project_id: i64, branch_keys: &[String]) -> Result<MergeSnapshot> {
    let mut snapshot = MergeSnapshot {
        version: SNAPSHOT_VERSION,
        branches: Vec::new(),
        reps: Vec::new(),
        crops: Vec::new(),
        project_images: Vec::new(),
    };

    for key in branch_keys {
        let mut stmt = tx.prepare(
            "SELECT id, branch_key, display_name FROM branches
             WHERE project_id = ? AND branch_key = ?",
        )?;
        snapshot.branches.extend(
            stmt.query_map(params![project_id, key], |row| {
                Ok(BranchSnap {
                    id: row.get(0)?,
                    branch_key: row.get(1)?,
                    display_name: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok()),
        );

        let mut stmt = tx.prepare(
            "SELECT branch_key, label, count, centroid, rep_path, rep_thumb_png
             FROM face_branch_reps WHERE project_id = ? AND branch_key = ?",
        )?;
        snapshot.reps.extend(
            stmt.query_map(params![project_id, key], |row| {
                let centroid: Option<Vec<u8>> = row.get(3)?;
                let thumb: Option<Vec<u8>> = row.get(5)?;
                Ok(RepSnap {
                    branch_key: row.get(0)?,
                    label: row.get(1)?,
                    count: row.get(2)?,
                    centroid_b64: centroid.map(|b| BASE64.encode(b)),
                    rep_path: row.get(4)?,
                    rep_thumb_png_b64: thumb.map(|b| BASE64.encode(b)),
                })
            })?
            .filter_map(|r| r.ok()),
        );

        let mut stmt = tx.prepare(
            "SELECT id, branch_key, image_path, crop_path,
                    bbox_x, bbox_y, bbox_w, bbox_h,
                    embedding, quality_score, is_representative
             FROM face_crops WHERE project_id = ? AND branch_key = ?",
        )?;
        snapshot.crops.extend(
            stmt.query_map(params![project_id, key], |row| {
                let embedding: Option<Vec<u8>> = row.get(8)?;
                Ok(CropSnap {
                    id: row.get(0)?,
                    branch_key: row.get(1)?,
                    image_path: row.get(2)?,
                    crop_path: row.get(3)?,
                    bbox: (row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?),
                    embedding_b64: embedding.map(|b| BASE64.encode(b)),
                    quality_score: row.get(9)?,
                    is_representative: row.get::<_, i64>(10)? != 0,
                })
            })?
            .filter_map(|r| r.ok()),
        );

        let mut stmt = tx.prepare(
            "SELECT id, branch_key, image_path, label FROM project_images
             WHERE project_id = ? AND branch_key = ?",
        )?;
        snapshot.project_images.extend(
            stmt.query_map(params![project_id, key], |row| {
                Ok(ImageSnap {
                    id: row.get(0)?,
                    branch_key: row.get(1)?,
                    image_path: row.get(2)?,
                    label: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok()),
        );
    }

    Ok(snapshot)
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::faces::{BoundingBox, NewFaceCrop};
    use crate::db::test_util::{make_project, open_temp};
    use std::collections::BTreeMap;

    fn seed_cluster(db: &CatalogDb, project: i64, branch: &str, crops: u32, centroid: &[f32]) {
        let rows: Vec<NewFaceCrop> = (0..crops)
            .map(|n| NewFaceCrop {
                branch_key: branch.to_string(),
                image_path: format!("/lib/{branch}_{n}.jpg"),
                crop_path: format!("/crops/{branch}_{n}.png"),
                bbox: BoundingBox {
                    x: 0,
                    y: 0,
                    width: 48,
                    height: 48,
                },
                embedding: None,
                quality_score: Some(0.8),
                is_representative: n == 0,
            })
            .collect();
        db.add_face_crops_bulk(project, &rows).unwrap();
        db.ensure_branch(project, branch, branch).unwrap();
        db.upsert_face_branch_rep(
            project,
            branch,
            Some(branch),
            crops as i64,
            Some(centroid),
            Some(&format!("/crops/{branch}_0.png")),
            Some(&[0x89, 0x50, 0x4e, 0x47]),
        )
        .unwrap();
    }

    fn branch_counts(db: &CatalogDb, project: i64) -> BTreeMap<String, i64> {
        db.face_branch_summary(project)
            .unwrap()
            .into_iter()
            .map(|(key, count, _)| (key, count))
            .collect()
    }

    #[test]
    fn test_merge_and_undo_round_trip() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let service = FaceClusterService::new(db.clone());

        seed_cluster(&db, project, "face_001", 3, &[0.1, 0.1]);
        seed_cluster(&db, project, "face_002", 2, &[0.2, 0.2]);
        seed_cluster(&db, project, "face_003", 1, &[0.9, 0.9]);

        let pre_counts = branch_counts(&db, project);
        let pre_crops: Vec<_> = db.face_crops_for_branch(project, "face_002").unwrap();

        let outcome = service
            .merge(
                project,
                "face_001",
                &["face_002".to_string(), "face_003".to_string()],
            )
            .unwrap();
        assert_eq!(outcome.target_count, 6);
        assert_eq!(outcome.moved_crops, 3);

        let merged = branch_counts(&db, project);
        assert_eq!(merged["face_001"], 6);
        assert!(!merged.contains_key("face_002"));
        assert!(!merged.contains_key("face_003"));
        assert!(db.face_branch_rep(project, "face_002").unwrap().is_none());

        assert!(service.undo_last(project).unwrap());

        let restored = branch_counts(&db, project);
        assert_eq!(restored, pre_counts);
        let restored_crops = db.face_crops_for_branch(project, "face_002").unwrap();
        assert_eq!(restored_crops.len(), pre_crops.len());
        for (before, after) in pre_crops.iter().zip(restored_crops.iter()) {
            assert_eq!(before.id, after.id);
            assert_eq!(before.branch_key, after.branch_key);
            assert_eq!(before.crop_path, after.crop_path);
        }

        // Rep binaries survive the base64 round trip.
        let rep = db.face_branch_rep(project, "face_002").unwrap().unwrap();
        assert_eq!(rep.rep_thumb_png, Some(vec![0x89, 0x50, 0x4e, 0x47]));
        assert_eq!(rep.centroid.as_deref(), Some([0.2f32, 0.2f32].as_slice()));

        // History row is consumed; a second undo is a no-op.
        assert!(!service.undo_last(project).unwrap());
    }

    #[test]
    fn test_merge_undo_merge_is_stable() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let service = FaceClusterService::new(db.clone());

        seed_cluster(&db, project, "face_001", 3, &[0.1, 0.1]);
        seed_cluster(&db, project, "face_002", 2, &[0.2, 0.2]);

        let sources = vec!["face_002".to_string()];
        let first = service.merge(project, "face_001", &sources).unwrap();
        service.undo_last(project).unwrap();
        let second = service.merge(project, "face_001", &sources).unwrap();

        assert_eq!(first.target_count, second.target_count);
        assert_eq!(first.moved_crops, second.moved_crops);
        let counts = branch_counts(&db, project);
        assert_eq!(counts["face_001"], 5);
    }

    #[test]
    fn test_merge_rejects_target_in_sources() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let service = FaceClusterService::new(db.clone());
        seed_cluster(&db, project, "face_001", 2, &[0.1, 0.1]);

        assert!(service
            .merge(project, "face_001", &["face_001".to_string()])
            .is_err());
    }

    #[test]
    fn test_merge_suggestions_sorted_and_filtered() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let service = FaceClusterService::new(db.clone());

        seed_cluster(&db, project, "face_001", 5, &[0.0, 0.0]);
        seed_cluster(&db, project, "face_002", 4, &[0.1, 0.0]);
        seed_cluster(&db, project, "face_003", 3, &[0.3, 0.0]);
        // Too small to suggest, even though it is close.
        seed_cluster(&db, project, "face_004", 1, &[0.05, 0.0]);
        // Too far away.
        seed_cluster(&db, project, "face_005", 5, &[5.0, 5.0]);

        let suggestions = service
            .merge_suggestions(project, SUGGESTION_THRESHOLD, SUGGESTION_MIN_COUNT, 10)
            .unwrap();

        assert_eq!(suggestions.len(), 3);
        assert_eq!(suggestions[0].branch_a, "face_001");
        assert_eq!(suggestions[0].branch_b, "face_002");
        assert!(suggestions[0].distance <= suggestions[1].distance);
        assert!(suggestions
            .iter()
            .all(|s| s.branch_a != "face_004" && s.branch_b != "face_004"));
        assert!(suggestions
            .iter()
            .all(|s| s.branch_a != "face_005" && s.branch_b != "face_005"));
    }
}
