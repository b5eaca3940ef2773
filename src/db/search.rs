//! Search history and saved searches.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::CatalogDb;

/// Only this many top result ids are persisted per history row.
const TOP_IDS_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct SearchRecord {
    pub id: i64,
    pub query_type: String,
    pub query_text: Option<String>,
    pub query_image_path: Option<String>,
    pub result_count: i64,
    pub top_photo_ids: Vec<i64>,
    pub filters: Option<String>,
    pub execution_time_ms: f64,
    pub model: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct SavedSearch {
    pub id: i64,
    pub name: String,
    pub query_type: String,
    pub query_text: Option<String>,
    pub query_image_path: Option<String>,
    pub filters: Option<String>,
    pub model: Option<String>,
    pub use_count: i64,
    pub last_used_at: Option<String>,
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchRecord> {
    let top_ids_json: Option<String> = row.get(5)?;
    Ok(SearchRecord {
        id: row.get(0)?,
        query_type: row.get(1)?,
        query_text: row.get(2)?,
        query_image_path: row.get(3)?,
        result_count: row.get(4)?,
        top_photo_ids: top_ids_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        filters: row.get(6)?,
        execution_time_ms: row.get(7)?,
        model: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const RECORD_COLS: &str = "id, query_type, query_text, query_image_path, result_count, \
                           top_photo_ids, filters, execution_time_ms, model, created_at";

fn saved_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SavedSearch> {
    Ok(SavedSearch {
        id: row.get(0)?,
        name: row.get(1)?,
        query_type: row.get(2)?,
        query_text: row.get(3)?,
        query_image_path: row.get(4)?,
        filters: row.get(5)?,
        model: row.get(6)?,
        use_count: row.get(7)?,
        last_used_at: row.get(8)?,
    })
}

const SAVED_COLS: &str = "id, name, query_type, query_text, query_image_path, filters, model, \
                          use_count, last_used_at";

impl CatalogDb {
    #[allow(clippy::too_many_arguments)]
    pub fn record_search(
        &self,
        query_type: &str,
        query_text: Option<&str>,
        query_image_path: Option<&str>,
        result_count: i64,
        top_photo_ids: &[i64],
        filters: Option<&str>,
        execution_time_ms: f64,
        model: Option<&str>,
    ) -> Result<i64> {
        let top: Vec<i64> = top_photo_ids.iter().take(TOP_IDS_LIMIT).copied().collect();
        let top_json = serde_json::to_string(&top)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO search_history
                     (query_type, query_text, query_image_path, result_count,
                      top_photo_ids, filters, execution_time_ms, model)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    query_type,
                    query_text,
                    query_image_path,
                    result_count,
                    top_json,
                    filters,
                    execution_time_ms,
                    model
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn recent_searches(
        &self,
        limit: i64,
        query_type: Option<&str>,
    ) -> Result<Vec<SearchRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLS} FROM search_history
                 WHERE (?1 IS NULL OR query_type = ?1)
                 ORDER BY id DESC LIMIT ?2"
            ))?;
            let records = stmt
                .query_map(params![query_type, limit], record_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(records)
        })
    }

    pub fn search_history_by_keyword(&self, keyword: &str, limit: i64) -> Result<Vec<SearchRecord>> {
        let pattern = format!("%{keyword}%");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLS} FROM search_history
                 WHERE query_text LIKE ? COLLATE NOCASE
                 ORDER BY id DESC LIMIT ?"
            ))?;
            let records = stmt
                .query_map(params![pattern, limit], record_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(records)
        })
    }

    /// Promote a query to a named saved search. The name is unique; saving
    /// under an existing name replaces the stored query.
    pub fn save_search(
        &self,
        name: &str,
        query_type: &str,
        query_text: Option<&str>,
        query_image_path: Option<&str>,
        filters: Option<&str>,
        model: Option<&str>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO saved_search (name, query_type, query_text, query_image_path, filters, model)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(name) DO UPDATE SET
                     query_type = excluded.query_type,
                     query_text = excluded.query_text,
                     query_image_path = excluded.query_image_path,
                     filters = excluded.filters,
                     model = excluded.model",
                params![name, query_type, query_text, query_image_path, filters, model],
            )?;
            let id = conn.query_row(
                "SELECT id FROM saved_search WHERE name = ?",
                [name],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn saved_searches(&self) -> Result<Vec<SavedSearch>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SAVED_COLS} FROM saved_search ORDER BY name"
            ))?;
            let rows = stmt
                .query_map([], saved_from_row)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    /// Fetch a saved search for execution, bumping its usage counters.
    pub fn use_saved_search(&self, saved_search_id: i64) -> Result<Option<SavedSearch>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE saved_search
                 SET use_count = use_count + 1, last_used_at = datetime('now')
                 WHERE id = ?",
                [saved_search_id],
            )?;
            Ok(conn
                .query_row(
                    &format!("SELECT {SAVED_COLS} FROM saved_search WHERE id = ?"),
                    [saved_search_id],
                    saved_from_row,
                )
                .optional()?)
        })
    }

    pub fn delete_saved_search(&self, saved_search_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM saved_search WHERE id = ?", [saved_search_id])?;
            Ok(removed > 0)
        })
    }

    /// Clear history entirely, or only rows older than `older_than_days`.
    pub fn clear_search_history(&self, older_than_days: Option<i64>) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = match older_than_days {
                Some(days) => conn.execute(
                    "DELETE FROM search_history
                     WHERE created_at < datetime('now', ?)",
                    [format!("-{days} days")],
                )?,
                None => conn.execute("DELETE FROM search_history", [])?,
            };
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::open_temp;

    #[test]
    fn test_record_truncates_top_ids() {
        let (_dir, db) = open_temp();
        let ids: Vec<i64> = (1..=20).collect();
        db.record_search("text", Some("beach sunset"), None, 20, &ids, None, 12.5, Some("m"))
            .unwrap();

        let recent = db.recent_searches(10, None).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].top_photo_ids.len(), 10);
        assert_eq!(recent[0].top_photo_ids[0], 1);
    }

    #[test]
    fn test_saved_search_use_count() {
        let (_dir, db) = open_temp();
        let id = db
            .save_search("my beach", "text", Some("beach"), None, None, Some("m"))
            .unwrap();

        let first = db.use_saved_search(id).unwrap().unwrap();
        assert_eq!(first.use_count, 1);
        let second = db.use_saved_search(id).unwrap().unwrap();
        assert_eq!(second.use_count, 2);
        assert!(second.last_used_at.is_some());
    }

    #[test]
    fn test_clear_history() {
        let (_dir, db) = open_temp();
        db.record_search("text", Some("a"), None, 0, &[], None, 1.0, None)
            .unwrap();
        db.record_search("image", None, Some("/x.jpg"), 0, &[], None, 1.0, None)
            .unwrap();

        assert_eq!(db.clear_search_history(Some(30)).unwrap(), 0);
        assert_eq!(db.clear_search_history(None).unwrap(), 2);
    }

    #[test]
    fn test_keyword_filter() {
        let (_dir, db) = open_temp();
        db.record_search("text", Some("Beach sunset"), None, 3, &[], None, 1.0, None)
            .unwrap();
        db.record_search("text", Some("mountain"), None, 2, &[], None, 1.0, None)
            .unwrap();

        let hits = db.search_history_by_keyword("beach", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].query_text.as_deref(), Some("Beach sunset"));
    }
}
