//! Semantic search: brute-force k-NN over stored embeddings, Rocchio
//! relevance feedback, and embedding maintenance.
//!
//! Vectors are unit-norm, so cosine similarity is a plain dot product.
//! Brute force is fine at this catalog's scale; an ANN index can slot in
//! behind `search` later without changing callers.

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::db::CatalogDb;
use crate::extract::FeatureExtractor;

/// Rocchio weights `(alpha, beta, gamma)`.
#[derive(Debug, Clone, Copy)]
pub struct RocchioWeights {
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
}

impl Default for RocchioWeights {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 0.75,
            gamma: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub photo_id: i64,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct EmbedOutcome {
    pub embedded: usize,
    pub failed: usize,
}

pub struct SemanticSearchService {
    db: Arc<CatalogDb>,
}

impl SemanticSearchService {
    pub fn new(db: Arc<CatalogDb>) -> Self {
        Self { db }
    }

    /// k-NN over the stored embeddings of `model`. An optional candidate
    /// set prefilters (UI filters pass one); scores are cosine
    /// similarities, best first.
    pub fn search(
        &self,
        query_vec: &[f32],
        top_k: usize,
        model: &str,
        photo_ids: Option<&[i64]>,
    ) -> Result<Vec<SearchHit>> {
        let embeddings = self.db.embeddings_for_model(model, photo_ids)?;

        let mut hits: Vec<SearchHit> = embeddings
            .iter()
            .filter(|(_, vec)| vec.len() == query_vec.len())
            .map(|(photo_id, vec)| SearchHit {
                photo_id: *photo_id,
                score: dot(query_vec, vec),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Timed variant of [`search`] that also records a history row.
    pub fn search_recorded(
        &self,
        query_vec: &[f32],
        top_k: usize,
        model: &str,
        photo_ids: Option<&[i64]>,
        query_text: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        let started = Instant::now();
        let hits = self.search(query_vec, top_k, model, photo_ids)?;
        let top_ids: Vec<i64> = hits.iter().map(|h| h.photo_id).collect();
        self.db.record_search(
            if query_text.is_some() { "text" } else { "vector" },
            query_text,
            None,
            hits.len() as i64,
            &top_ids,
            None,
            started.elapsed().as_secs_f64() * 1000.0,
            Some(model),
        )?;
        Ok(hits)
    }

    /// Mean of the stored embeddings for `photo_ids`, L2-normalized.
    /// Missing embeddings are skipped; returns None when none exist.
    pub fn centroid(&self, photo_ids: &[i64], model: &str) -> Result<Option<Vec<f32>>> {
        let embeddings = self.db.embeddings_for_model(model, Some(photo_ids))?;
        if embeddings.is_empty() {
            return Ok(None);
        }

        let dim = embeddings[0].1.len();
        let mut sum = vec![0.0f32; dim];
        let mut used = 0usize;
        for (_, vec) in &embeddings {
            if vec.len() != dim {
                continue;
            }
            for (acc, v) in sum.iter_mut().zip(vec.iter()) {
                *acc += v;
            }
            used += 1;
        }
        if used == 0 {
            return Ok(None);
        }
        for v in sum.iter_mut() {
            *v /= used as f32;
        }
        normalize(&mut sum);
        Ok(Some(sum))
    }

    /// Rocchio refinement: `Q' = a*Q + b*centroid(D+) - g*centroid(D-)`,
    /// L2-normalized. With no positives the original query is returned
    /// unchanged.
    pub fn rocchio_refine(
        &self,
        query_vec: &[f32],
        positive_ids: &[i64],
        negative_ids: &[i64],
        weights: RocchioWeights,
        model: &str,
    ) -> Result<Vec<f32>> {
        let Some(positive_centroid) = self.centroid(positive_ids, model)? else {
            return Ok(query_vec.to_vec());
        };
        if positive_centroid.len() != query_vec.len() {
            bail!(
                "query dimension {} does not match stored embeddings {}",
                query_vec.len(),
                positive_centroid.len()
            );
        }
        let negative_centroid = if negative_ids.is_empty() {
            None
        } else {
            self.centroid(negative_ids, model)?
        };

        let mut refined: Vec<f32> = query_vec
            .iter()
            .zip(positive_centroid.iter())
            .map(|(q, p)| weights.alpha * q + weights.beta * p)
            .collect();
        if let Some(neg) = negative_centroid {
            for (r, n) in refined.iter_mut().zip(neg.iter()) {
                *r -= weights.gamma * n;
            }
        }
        normalize(&mut refined);
        Ok(refined)
    }

    /// Re-run a search with relevance feedback applied.
    pub fn rerank_with_feedback(
        &self,
        query_vec: &[f32],
        positive_ids: &[i64],
        negative_ids: &[i64],
        top_k: usize,
        model: &str,
        photo_ids: Option<&[i64]>,
    ) -> Result<Vec<SearchHit>> {
        let refined = self.rocchio_refine(
            query_vec,
            positive_ids,
            negative_ids,
            RocchioWeights::default(),
            model,
        )?;
        self.search(&refined, top_k, model, photo_ids)
    }

    /// "Find more like these": query from the centroid of the examples,
    /// no negative set.
    pub fn more_like_these(
        &self,
        example_ids: &[i64],
        top_k: usize,
        model: &str,
    ) -> Result<Vec<SearchHit>> {
        let Some(centroid) = self.centroid(example_ids, model)? else {
            return Ok(Vec::new());
        };
        self.search(&centroid, top_k, model, None)
    }

    /// Compute embeddings for photos that are missing or stale under
    /// `model`, using the injected extractor. Errors per photo are counted
    /// and logged, not fatal.
    pub fn embed_pending(
        &self,
        project_id: i64,
        extractor: &dyn FeatureExtractor,
        model: &str,
        limit: i64,
        cancel: &AtomicBool,
    ) -> Result<EmbedOutcome> {
        let artifact_version = self.db.artifact_version(model)?;
        let mut targets = self.db.missing_embedding_photo_ids(project_id, model, limit)?;
        for photo_id in self
            .db
            .stale_embedding_photo_ids(project_id, model, artifact_version, limit)?
        {
            if let Some(row) = self.db.photo_by_id(photo_id)? {
                targets.push((photo_id, row.path));
            }
        }

        let mut outcome = EmbedOutcome::default();
        for (photo_id, path) in targets {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            match extractor.embed_image(std::path::Path::new(&path), model) {
                Ok(embedding) => {
                    self.db.store_embedding(
                        photo_id,
                        model,
                        &embedding.vec,
                        Some(&embedding.source_hash),
                        embedding.source_mtime.as_deref(),
                        artifact_version,
                    )?;
                    outcome.embedded += 1;
                }
                Err(e) => {
                    tracing::warn!(photo_id, path, error = %e, "Embedding failed");
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{make_project, open_temp};
    use std::path::PathBuf;

    const MODEL: &str = "clip-vit-b32";
    const DIM: usize = 100;

    /// Photo `i` gets the basis vector `e_i`: every pair of photos is
    /// orthogonal, so scores under any query are exactly its components.
    fn one_hot(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; DIM];
        v[i] = 1.0;
        v
    }

    /// Query with strictly decreasing affinity for photos 0, 1, 2, ...
    fn harmonic_query() -> Vec<f32> {
        let mut v: Vec<f32> = (0..DIM).map(|i| 1.0 / (1.0 + i as f32)).collect();
        normalize(&mut v);
        v
    }

    fn seed_photos(db: &CatalogDb, project: i64, n: usize) -> Vec<i64> {
        let folder = db.ensure_folder(project, "/lib", "lib", None).unwrap();
        (0..n)
            .map(|i| {
                let id = db
                    .upsert_photo(
                        &PathBuf::from(format!("/lib/{i:03}.jpg")),
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
                db.store_embedding(id, MODEL, &one_hot(i), None, None, 1)
                    .unwrap();
                id
            })
            .collect()
    }

    #[test]
    fn test_search_orders_by_cosine() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let ids = seed_photos(&db, project, 10);

        let service = SemanticSearchService::new(db.clone());
        let hits = service.search(&harmonic_query(), 3, MODEL, None).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].photo_id, ids[0]);
        assert_eq!(hits[1].photo_id, ids[1]);
        assert!(hits[0].score > hits[1].score && hits[1].score > hits[2].score);
    }

    #[test]
    fn test_search_respects_candidate_set() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let ids = seed_photos(&db, project, 10);

        let service = SemanticSearchService::new(db.clone());
        let candidates = vec![ids[7], ids[8]];
        let hits = service
            .search(&harmonic_query(), 10, MODEL, Some(&candidates))
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| candidates.contains(&h.photo_id)));
    }

    #[test]
    fn test_rocchio_feedback_moves_ranking() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        seed_photos(&db, project, DIM);
        let service = SemanticSearchService::new(db.clone());

        let query = harmonic_query();
        let baseline = service.search(&query, DIM, MODEL, None).unwrap();

        // Mark result ranks 1, 3, 7 relevant and rank 2 not relevant.
        let positives = vec![
            baseline[0].photo_id,
            baseline[2].photo_id,
            baseline[6].photo_id,
        ];
        let negative = vec![baseline[1].photo_id];

        let reranked = service
            .rerank_with_feedback(&query, &positives, &negative, DIM, MODEL, None)
            .unwrap();

        let top5: Vec<i64> = reranked.iter().take(5).map(|h| h.photo_id).collect();
        assert!(positives.iter().any(|p| top5.contains(p)));

        let rank_of =
            |hits: &[SearchHit], id: i64| hits.iter().position(|h| h.photo_id == id).unwrap();
        let before = rank_of(&baseline, negative[0]);
        let after = rank_of(&reranked, negative[0]);
        assert!(after >= before + 3, "negative moved from {before} to {after}");
    }

    #[test]
    fn test_rocchio_without_positives_is_identity() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        seed_photos(&db, project, 4);
        let service = SemanticSearchService::new(db.clone());

        let query = one_hot(1);
        let refined = service
            .rocchio_refine(&query, &[], &[999], RocchioWeights::default(), MODEL)
            .unwrap();
        assert_eq!(refined, query);
    }

    #[test]
    fn test_more_like_these() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let ids = seed_photos(&db, project, 20);
        let service = SemanticSearchService::new(db.clone());

        let hits = service.more_like_these(&[ids[3], ids[4]], 5, MODEL).unwrap();
        assert!(hits.len() >= 2);
        // The examples themselves dominate the neighborhood.
        assert!(hits[..2].iter().all(|h| h.photo_id == ids[3] || h.photo_id == ids[4]));
    }

    #[test]
    fn test_search_recorded_writes_history() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        seed_photos(&db, project, 5);
        let service = SemanticSearchService::new(db.clone());

        service
            .search_recorded(&harmonic_query(), 3, MODEL, None, Some("red bicycle"))
            .unwrap();
        let recent = db.recent_searches(10, Some("text")).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].result_count, 3);
        assert_eq!(recent[0].model.as_deref(), Some(MODEL));
    }
}
