//! Asset identity and stack construction.
//!
//! Stacks are rebuilt, never edited: for a given `(type, rule_version)` the
//! old set is deleted and the new one inserted in a single transaction, with
//! the build parameters snapshotted to `media_stack_meta` so results stay
//! reproducible.

use anyhow::Result;
use rusqlite::params;
use serde::Serialize;
use std::sync::Arc;

use crate::db::assets::{DuplicateAsset, InstanceProvenance};
use crate::db::stacks::{add_stack_member_tx, create_stack_tx, delete_stacks_tx, StackType};
use crate::db::CatalogDb;
use crate::extract::hamming_distance;

/// Parameters for one stack rebuild, serialized into `media_stack_meta`.
#[derive(Debug, Clone, Serialize)]
pub struct StackBuildParams {
    pub rule_version: String,
    /// Hamming budget for near-duplicates.
    pub max_hamming: u32,
    /// Cosine floor for similar stacks.
    pub min_cosine: f32,
    /// Same-device shots closer than this are one burst.
    pub burst_window_secs: i64,
    /// Embedding model consulted for similar stacks.
    pub model: String,
}

impl Default for StackBuildParams {
    fn default() -> Self {
        Self {
            rule_version: "1".to_string(),
            max_hamming: 8,
            min_cosine: 0.92,
            burst_window_secs: 3,
            model: "clip-vit-b32".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StackRebuildOutcome {
    pub stacks: usize,
    pub members: usize,
}

pub struct DuplicateService {
    db: Arc<CatalogDb>,
}

impl DuplicateService {
    pub fn new(db: Arc<CatalogDb>) -> Self {
        Self { db }
    }

    /// Record content identity for a hashed photo: upsert the asset keyed by
    /// `(project_id, content_hash)` and link the photo as an instance.
    /// Idempotent; safe to call from every hashing pass.
    pub fn record_asset_identity(
        &self,
        project_id: i64,
        photo_id: i64,
        content_hash: &str,
        perceptual_hash: Option<&str>,
        provenance: &InstanceProvenance,
    ) -> Result<i64> {
        let asset_id = self.db.ensure_asset(project_id, content_hash, Some(photo_id))?;
        if let Some(p_hash) = perceptual_hash {
            let current = self.db.asset_by_hash(project_id, content_hash)?;
            if current.map(|a| a.perceptual_hash.is_none()).unwrap_or(false) {
                self.db.set_asset_perceptual_hash(asset_id, p_hash)?;
            }
        }
        self.db.link_instance(project_id, asset_id, photo_id, provenance)?;
        Ok(asset_id)
    }

    pub fn list_duplicates(
        &self,
        project_id: i64,
        min_instances: i64,
        limit: i64,
    ) -> Result<Vec<DuplicateAsset>> {
        self.db.list_duplicates(project_id, min_instances, limit)
    }

    /// Exact-duplicate stacks: one stack per asset with two or more
    /// instances, members ranked by photo id so ordering is stable across
    /// rebuilds.
    pub fn rebuild_duplicate_stacks(
        &self,
        project_id: i64,
        params: &StackBuildParams,
    ) -> Result<StackRebuildOutcome> {
        let duplicates = self.db.list_duplicates(project_id, 2, i64::MAX)?;
        let mut groups = Vec::new();
        for dup in &duplicates {
            let members = self.db.instance_photo_ids(project_id, dup.asset_id)?;
            let scored: Vec<(i64, Option<f64>)> =
                members.into_iter().map(|id| (id, Some(1.0))).collect();
            groups.push(scored);
        }
        self.write_stacks(project_id, StackType::Duplicate, params, groups)
    }

    /// Near-duplicate stacks: greedy grouping on perceptual-hash Hamming
    /// distance.
    pub fn rebuild_near_duplicate_stacks(
        &self,
        project_id: i64,
        params: &StackBuildParams,
    ) -> Result<StackRebuildOutcome> {
        let photos = self.photos_with_content_hash(project_id)?;
        let mut grouped = vec![false; photos.len()];
        let mut groups: Vec<Vec<(i64, Option<f64>)>> = Vec::new();

        for i in 0..photos.len() {
            if grouped[i] {
                continue;
            }
            let (anchor_id, ref anchor_hash) = photos[i];
            let mut group = vec![(anchor_id, Some(0.0))];
            grouped[i] = true;

            for j in (i + 1)..photos.len() {
                if grouped[j] {
                    continue;
                }
                let (other_id, ref other_hash) = photos[j];
                let Ok(distance) = hamming_distance(anchor_hash, other_hash) else {
                    continue;
                };
                if distance <= params.max_hamming {
                    group.push((other_id, Some(distance as f64)));
                    grouped[j] = true;
                }
            }

            if group.len() >= 2 {
                groups.push(group);
            }
        }

        self.write_stacks(project_id, StackType::NearDuplicate, params, groups)
    }

    /// Similar stacks: greedy grouping on embedding cosine similarity. With
    /// unit-norm vectors the dot product is the cosine.
    pub fn rebuild_similar_stacks(
        &self,
        project_id: i64,
        params: &StackBuildParams,
    ) -> Result<StackRebuildOutcome> {
        let candidate_ids: Vec<i64> = self
            .db
            .all_photo_paths(project_id)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let embeddings = self
            .db
            .embeddings_for_model(&params.model, Some(&candidate_ids))?;

        let mut grouped = vec![false; embeddings.len()];
        let mut groups: Vec<Vec<(i64, Option<f64>)>> = Vec::new();

        for i in 0..embeddings.len() {
            if grouped[i] {
                continue;
            }
            let (anchor_id, ref anchor_vec) = embeddings[i];
            let mut group = vec![(anchor_id, Some(1.0))];
            grouped[i] = true;

            for j in (i + 1)..embeddings.len() {
                if grouped[j] {
                    continue;
                }
                let (other_id, ref other_vec) = embeddings[j];
                let cosine = dot(anchor_vec, other_vec);
                if cosine >= params.min_cosine {
                    group.push((other_id, Some(cosine as f64)));
                    grouped[j] = true;
                }
            }

            if group.len() >= 2 {
                groups.push(group);
            }
        }

        self.write_stacks(project_id, StackType::Similar, params, groups)
    }

    /// Burst stacks: consecutive shots from the same source device whose
    /// timestamps are within the window.
    pub fn rebuild_burst_stacks(
        &self,
        project_id: i64,
        params: &StackBuildParams,
    ) -> Result<StackRebuildOutcome> {
        // (photo_id, created_ts, device) ordered by device then time.
        let shots: Vec<(i64, i64, Option<i64>)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pm.id, pm.created_ts, mi.source_device_id
                 FROM photo_metadata pm
                 LEFT JOIN media_instance mi
                   ON mi.photo_id = pm.id AND mi.project_id = pm.project_id
                 WHERE pm.project_id = ? AND pm.created_ts IS NOT NULL
                 ORDER BY mi.source_device_id, pm.created_ts, pm.id",
            )?;
            let rows = stmt
                .query_map([project_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut groups: Vec<Vec<(i64, Option<f64>)>> = Vec::new();
        let mut current: Vec<(i64, Option<f64>)> = Vec::new();
        let mut last: Option<(i64, Option<i64>)> = None;

        for (photo_id, ts, device) in shots {
            let continues = match last {
                Some((last_ts, ref last_device)) => {
                    *last_device == device && ts - last_ts <= params.burst_window_secs
                }
                None => false,
            };
            if !continues {
                if current.len() >= 2 {
                    groups.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
            }
            current.push((photo_id, None));
            last = Some((ts, device));
        }
        if current.len() >= 2 {
            groups.push(current);
        }

        self.write_stacks(project_id, StackType::Burst, params, groups)
    }

    /// Swap the stacks of one `(type, rule_version)` atomically: delete the
    /// old set, insert the new one, members ranked from 1.
    fn write_stacks(
        &self,
        project_id: i64,
        stack_type: StackType,
        params: &StackBuildParams,
        groups: Vec<Vec<(i64, Option<f64>)>>,
    ) -> Result<StackRebuildOutcome> {
        let params_json = serde_json::to_string(params)?;
        let mut outcome = StackRebuildOutcome::default();

        self.db.with_tx(|tx| {
            delete_stacks_tx(tx, project_id, stack_type, &params.rule_version)?;
            for group in &groups {
                let representative = group.first().map(|(id, _)| *id);
                let stack_id = create_stack_tx(
                    tx,
                    project_id,
                    stack_type,
                    representative,
                    &params.rule_version,
                    &params_json,
                )?;
                for (rank0, (photo_id, score)) in group.iter().enumerate() {
                    add_stack_member_tx(tx, stack_id, *photo_id, *score, rank0 as i64 + 1)?;
                }
                outcome.stacks += 1;
                outcome.members += group.len();
            }
            Ok(())
        })?;

        tracing::info!(
            project_id,
            stack_type = stack_type.as_str(),
            rule_version = params.rule_version,
            stacks = outcome.stacks,
            members = outcome.members,
            "Rebuilt stacks"
        );
        Ok(outcome)
    }

    fn photos_with_content_hash(&self, project_id: i64) -> Result<Vec<(i64, String)>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, image_content_hash FROM photo_metadata
                 WHERE project_id = ? AND image_content_hash IS NOT NULL
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![project_id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::stacks::StackType;
    use crate::db::test_util::{make_project, open_temp};
    use std::path::PathBuf;

    fn add_photo(db: &CatalogDb, project: i64, name: &str, date_taken: Option<&str>) -> i64 {
        let folder = db.ensure_folder(project, "/lib", "lib", None).unwrap();
        db.upsert_photo(
            &PathBuf::from(format!("/lib/{name}")),
            folder,
            project,
            None,
            None,
            None,
            None,
            date_taken,
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_stacks_from_asset_identity() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let service = DuplicateService::new(db.clone());

        let a = add_photo(&db, project, "a/img.jpg", None);
        let b = add_photo(&db, project, "b/img.jpg", None);
        let unique = add_photo(&db, project, "c/img.jpg", None);

        service
            .record_asset_identity(project, a, "same", None, &InstanceProvenance::default())
            .unwrap();
        service
            .record_asset_identity(project, b, "same", None, &InstanceProvenance::default())
            .unwrap();
        service
            .record_asset_identity(project, unique, "other", None, &InstanceProvenance::default())
            .unwrap();

        let params = StackBuildParams::default();
        let outcome = service.rebuild_duplicate_stacks(project, &params).unwrap();
        assert_eq!(outcome.stacks, 1);
        assert_eq!(outcome.members, 2);

        let stacks = db.stacks_for(project, StackType::Duplicate, "1").unwrap();
        assert_eq!(stacks.len(), 1);
        let members = db.stack_members(stacks[0].stack_id).unwrap();
        assert_eq!(members[0].rank, 1);
        assert_eq!(members[1].rank, 2);
        assert_eq!(stacks[0].representative_photo_id, Some(a));

        // Rebuild replaces, never accumulates.
        service.rebuild_duplicate_stacks(project, &params).unwrap();
        assert_eq!(db.stacks_for(project, StackType::Duplicate, "1").unwrap().len(), 1);
    }

    #[test]
    fn test_burst_stacks_by_device_window() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let service = DuplicateService::new(db.clone());
        let device = db
            .register_device("cam-1", None, None, None, None, None)
            .unwrap();

        // Three shots one second apart, then one ten minutes later.
        let shots = [
            ("burst1.jpg", "2024:03:10 11:00:00"),
            ("burst2.jpg", "2024:03:10 11:00:01"),
            ("burst3.jpg", "2024:03:10 11:00:02"),
            ("later.jpg", "2024:03:10 11:10:00"),
        ];
        for (i, (name, taken)) in shots.iter().enumerate() {
            let id = add_photo(&db, project, name, Some(taken));
            service
                .record_asset_identity(
                    project,
                    id,
                    &format!("hash-{i}"),
                    None,
                    &InstanceProvenance {
                        source_device_id: Some(device),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let params = StackBuildParams::default();
        let outcome = service.rebuild_burst_stacks(project, &params).unwrap();
        assert_eq!(outcome.stacks, 1);
        assert_eq!(outcome.members, 3);
    }

    #[test]
    fn test_similar_stacks_group_by_cosine() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let service = DuplicateService::new(db.clone());
        let model = "clip-vit-b32";

        let a = add_photo(&db, project, "a.jpg", None);
        let b = add_photo(&db, project, "b.jpg", None);
        let c = add_photo(&db, project, "c.jpg", None);
        db.store_embedding(a, model, &[1.0, 0.0], None, None, 1).unwrap();
        db.store_embedding(b, model, &[0.999, 0.0447], None, None, 1).unwrap();
        db.store_embedding(c, model, &[0.0, 1.0], None, None, 1).unwrap();

        let params = StackBuildParams::default();
        let outcome = service.rebuild_similar_stacks(project, &params).unwrap();
        assert_eq!(outcome.stacks, 1);
        assert_eq!(outcome.members, 2);
    }

    #[test]
    fn test_stack_meta_snapshot() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let service = DuplicateService::new(db.clone());

        let a = add_photo(&db, project, "a.jpg", None);
        let b = add_photo(&db, project, "b.jpg", None);
        service
            .record_asset_identity(project, a, "same", None, &InstanceProvenance::default())
            .unwrap();
        service
            .record_asset_identity(project, b, "same", None, &InstanceProvenance::default())
            .unwrap();

        let params = StackBuildParams {
            rule_version: "7".to_string(),
            ..Default::default()
        };
        service.rebuild_duplicate_stacks(project, &params).unwrap();

        let stacks = db.stacks_for(project, StackType::Duplicate, "7").unwrap();
        let meta = db.stack_meta(stacks[0].stack_id).unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(parsed["rule_version"], "7");
    }
}
