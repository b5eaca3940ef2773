//! Semantic embedding storage.
//!
//! One row per `(photo_id, model)`. Vectors are stored pre-normalized as
//! little-endian float32 blobs together with the source hash and artifact
//! version used for staleness detection.

use anyhow::{bail, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, OptionalExtension};

use super::CatalogDb;

#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub photo_id: i64,
    pub model: String,
    pub vec: Vec<f32>,
    pub dim: i64,
    pub norm: Option<f64>,
    pub source_photo_hash: Option<String>,
    pub source_photo_mtime: Option<String>,
    pub artifact_version: i64,
}

/// Convert f32 slice to bytes for storage.
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector.
pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap();
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Some drivers hand BLOB columns back as hex text; decode either form.
fn blob_from_value(value: ValueRef<'_>) -> Result<Vec<u8>> {
    match value {
        ValueRef::Blob(b) => Ok(b.to_vec()),
        ValueRef::Text(t) => {
            let text = std::str::from_utf8(t)?;
            let mut bytes = Vec::with_capacity(text.len() / 2);
            let chars: Vec<u8> = text.bytes().collect();
            if chars.len() % 2 != 0 {
                bail!("hex-encoded blob has odd length");
            }
            for pair in chars.chunks_exact(2) {
                let hi = (pair[0] as char).to_digit(16);
                let lo = (pair[1] as char).to_digit(16);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => bytes.push(((hi << 4) | lo) as u8),
                    _ => bail!("invalid hex in blob column"),
                }
            }
            Ok(bytes)
        }
        other => bail!("unexpected column type for embedding blob: {:?}", other.data_type()),
    }
}

impl CatalogDb {
    /// Store an embedding. The vector must already be L2-normalized; its
    /// norm is persisted for sanity checks.
    pub fn store_embedding(
        &self,
        photo_id: i64,
        model: &str,
        vec: &[f32],
        source_photo_hash: Option<&str>,
        source_photo_mtime: Option<&str>,
        artifact_version: i64,
    ) -> Result<()> {
        if vec.is_empty() {
            bail!("refusing to store an empty embedding for photo {photo_id}");
        }
        let norm: f64 = vec.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt();
        let bytes = embedding_to_bytes(vec);

        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO semantic_embeddings
                     (photo_id, model, embedding, dim, norm,
                      source_photo_hash, source_photo_mtime, artifact_version, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
                params![
                    photo_id,
                    model,
                    bytes,
                    vec.len() as i64,
                    norm,
                    source_photo_hash,
                    source_photo_mtime,
                    artifact_version
                ],
            )?;
            tx.execute(
                "INSERT INTO semantic_index_meta (model, artifact_version, dim, embedded_count, updated_at)
                 VALUES (?1, ?2, ?3,
                         (SELECT COUNT(*) FROM semantic_embeddings WHERE model = ?1),
                         datetime('now'))
                 ON CONFLICT(model) DO UPDATE SET
                     dim = excluded.dim,
                     embedded_count = excluded.embedded_count,
                     updated_at = excluded.updated_at",
                params![model, artifact_version, vec.len() as i64],
            )?;
            Ok(())
        })
    }

    pub fn get_embedding(&self, photo_id: i64, model: &str) -> Result<Option<EmbeddingRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT photo_id, model, embedding, dim, norm,
                        source_photo_hash, source_photo_mtime, artifact_version
                 FROM semantic_embeddings WHERE photo_id = ? AND model = ?",
            )?;
            let mut rows = stmt.query(params![photo_id, model])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            let bytes = blob_from_value(row.get_ref(2)?)?;
            Ok(Some(EmbeddingRow {
                photo_id: row.get(0)?,
                model: row.get(1)?,
                vec: bytes_to_embedding(&bytes),
                dim: row.get(3)?,
                norm: row.get(4)?,
                source_photo_hash: row.get(5)?,
                source_photo_mtime: row.get(6)?,
                artifact_version: row.get(7)?,
            }))
        })
    }

    /// All embeddings for a model, optionally restricted to a candidate set
    /// of photo ids (UI filters pass one).
    pub fn embeddings_for_model(
        &self,
        model: &str,
        photo_ids: Option<&[i64]>,
    ) -> Result<Vec<(i64, Vec<f32>)>> {
        self.with_conn(|conn| {
            let mut out = Vec::new();
            match photo_ids {
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT photo_id, embedding FROM semantic_embeddings WHERE model = ?",
                    )?;
                    let mut rows = stmt.query([model])?;
                    while let Some(row) = rows.next()? {
                        let bytes = blob_from_value(row.get_ref(1)?)?;
                        out.push((row.get(0)?, bytes_to_embedding(&bytes)));
                    }
                }
                Some(ids) => {
                    for chunk in ids.chunks(500) {
                        let placeholders = vec!["?"; chunk.len()].join(",");
                        let mut stmt = conn.prepare(&format!(
                            "SELECT photo_id, embedding FROM semantic_embeddings
                             WHERE model = ? AND photo_id IN ({placeholders})"
                        ))?;
                        let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&model];
                        params_vec.extend(chunk.iter().map(|id| id as &dyn rusqlite::ToSql));
                        let mut rows = stmt.query(params_vec.as_slice())?;
                        while let Some(row) = rows.next()? {
                            let bytes = blob_from_value(row.get_ref(1)?)?;
                            out.push((row.get(0)?, bytes_to_embedding(&bytes)));
                        }
                    }
                }
            }
            Ok(out)
        })
    }

    /// Photo ids whose stored embedding no longer matches the photo's
    /// current content hash or the model's artifact version.
    pub fn stale_embedding_photo_ids(
        &self,
        project_id: i64,
        model: &str,
        artifact_version: i64,
        limit: i64,
    ) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.photo_id
                 FROM semantic_embeddings e
                 JOIN photo_metadata p ON p.id = e.photo_id
                 WHERE p.project_id = ? AND e.model = ?
                   AND (e.source_photo_hash IS NOT p.image_content_hash
                        OR e.artifact_version != ?)
                 ORDER BY e.photo_id LIMIT ?",
            )?;
            let ids = stmt
                .query_map(params![project_id, model, artifact_version, limit], |row| {
                    row.get(0)
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(ids)
        })
    }

    /// Photos of a project with no embedding at all for the model.
    pub fn missing_embedding_photo_ids(
        &self,
        project_id: i64,
        model: &str,
        limit: i64,
    ) -> Result<Vec<(i64, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.path
                 FROM photo_metadata p
                 LEFT JOIN semantic_embeddings e ON e.photo_id = p.id AND e.model = ?
                 WHERE p.project_id = ? AND e.photo_id IS NULL
                 ORDER BY p.id LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![model, project_id, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    pub fn count_embeddings(&self, model: &str) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM semantic_embeddings WHERE model = ?",
                [model],
                |row| row.get(0),
            )?)
        })
    }

    /// Current artifact version for a model, defaulting to 1.
    pub fn artifact_version(&self, model: &str) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT artifact_version FROM semantic_index_meta WHERE model = ?",
                    [model],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(1))
        })
    }

    /// Force-recompute knob: bump the artifact version so every stored
    /// embedding for the model reads as stale.
    pub fn bump_artifact_version(&self, model: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO semantic_index_meta (model, artifact_version, updated_at)
                 VALUES (?, 2, datetime('now'))
                 ON CONFLICT(model) DO UPDATE SET
                     artifact_version = artifact_version + 1,
                     updated_at = excluded.updated_at",
                [model],
            )?;
            let version = conn.query_row(
                "SELECT artifact_version FROM semantic_index_meta WHERE model = ?",
                [model],
                |row| row.get(0),
            )?;
            Ok(version)
        })
    }

    pub fn semantic_index_summary(&self) -> Result<Vec<(String, i64, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model, artifact_version, embedded_count
                 FROM semantic_index_meta ORDER BY model",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{make_project, open_temp};
    use std::path::PathBuf;

    const MODEL: &str = "clip-vit-b32";

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
    fn test_embedding_round_trip() {
        let original = vec![0.6f32, 0.8, 0.0];
        let bytes = embedding_to_bytes(&original);
        assert_eq!(bytes_to_embedding(&bytes), original);
    }

    #[test]
    fn test_store_and_get() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let photo = add_photo(&db, project, "a.jpg");

        db.store_embedding(photo, MODEL, &[0.6, 0.8], Some("hash1"), None, 1)
            .unwrap();
        let row = db.get_embedding(photo, MODEL).unwrap().unwrap();
        assert_eq!(row.dim, 2);
        assert!((row.norm.unwrap() - 1.0).abs() < 1e-3);
        assert_eq!(row.vec, vec![0.6, 0.8]);
        assert_eq!(db.count_embeddings(MODEL).unwrap(), 1);
    }

    #[test]
    fn test_hex_text_blob_tolerated() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let photo = add_photo(&db, project, "a.jpg");

        // 1.0f32 little-endian = 00 00 80 3f
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO semantic_embeddings (photo_id, model, embedding, dim, norm)
                 VALUES (?, ?, '0000803f', 1, 1.0)",
                params![photo, MODEL],
            )?;
            Ok(())
        })
        .unwrap();

        let row = db.get_embedding(photo, MODEL).unwrap().unwrap();
        assert_eq!(row.vec, vec![1.0f32]);
    }

    #[test]
    fn test_staleness_by_hash_and_version() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let photo = add_photo(&db, project, "a.jpg");
        db.set_photo_hashes(photo, Some("filehash"), Some("dhash-v1"))
            .unwrap();

        db.store_embedding(photo, MODEL, &[1.0], Some("dhash-v1"), None, 1)
            .unwrap();
        assert!(db
            .stale_embedding_photo_ids(project, MODEL, 1, 10)
            .unwrap()
            .is_empty());

        // Content change flips staleness; an mtime-only change would not.
        db.set_photo_hashes(photo, None, Some("dhash-v2")).unwrap();
        assert_eq!(
            db.stale_embedding_photo_ids(project, MODEL, 1, 10).unwrap(),
            vec![photo]
        );

        db.set_photo_hashes(photo, None, Some("dhash-v1")).unwrap();
        let bumped = db.bump_artifact_version(MODEL).unwrap();
        assert!(bumped > 1);
        assert_eq!(
            db.stale_embedding_photo_ids(project, MODEL, bumped, 10)
                .unwrap(),
            vec![photo]
        );
    }
}
