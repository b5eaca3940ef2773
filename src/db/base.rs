//! Generic row helpers shared by the repositories.
//!
//! Where-clauses passed here are code-owned SQL fragments from the
//! repository layer, never user input. The only caller-parameterized piece
//! of SQL shape is `order_by`, which is validated against the table's
//! column allowlist before it reaches the engine.

use anyhow::{bail, Result};
use rusqlite::ToSql;

use super::CatalogDb;

/// Static description of a queryable table: its name and the columns that
/// may appear in an ORDER BY.
pub struct TableSpec {
    pub name: &'static str,
    pub order_columns: &'static [&'static str],
}

pub const PHOTOS: TableSpec = TableSpec {
    name: "photo_metadata",
    order_columns: &["id", "path", "created_ts", "created_date", "updated_at", "size_kb"],
};

pub const VIDEOS: TableSpec = TableSpec {
    name: "video_metadata",
    order_columns: &["id", "path", "created_ts", "created_date", "duration"],
};

pub const FOLDERS: TableSpec = TableSpec {
    name: "photo_folders",
    order_columns: &["id", "path", "name", "photo_count"],
};

pub const TAGS: TableSpec = TableSpec {
    name: "tags",
    order_columns: &["id", "name"],
};

pub const JOBS: TableSpec = TableSpec {
    name: "ml_job",
    order_columns: &["id", "kind", "state", "created_at"],
};

/// Validate an `ORDER BY` expression of the form `col` or `col DESC`
/// against the table's allowlist.
fn validated_order(spec: &TableSpec, order_by: &str) -> Result<String> {
    let mut parts = order_by.split_whitespace();
    let column = parts.next().unwrap_or_default();
    let direction = parts.next().unwrap_or("ASC");

    if !spec.order_columns.contains(&column) {
        bail!(
            "'{column}' is not an orderable column of {} (allowed: {})",
            spec.name,
            spec.order_columns.join(", ")
        );
    }
    let direction = match direction.to_ascii_uppercase().as_str() {
        "ASC" => "ASC",
        "DESC" => "DESC",
        other => bail!("invalid sort direction '{other}'"),
    };
    if parts.next().is_some() {
        bail!("order_by accepts a single column with optional direction");
    }
    Ok(format!("{column} {direction}"))
}

impl CatalogDb {
    pub fn count_where(
        &self,
        spec: &TableSpec,
        where_clause: Option<&str>,
        params: &[&dyn ToSql],
    ) -> Result<i64> {
        let sql = match where_clause {
            Some(clause) => format!("SELECT COUNT(*) FROM {} WHERE {clause}", spec.name),
            None => format!("SELECT COUNT(*) FROM {}", spec.name),
        };
        self.with_conn(|conn| Ok(conn.query_row(&sql, params, |row| row.get(0))?))
    }

    pub fn exists_where(
        &self,
        spec: &TableSpec,
        where_clause: &str,
        params: &[&dyn ToSql],
    ) -> Result<bool> {
        Ok(self.count_where(spec, Some(where_clause), params)? > 0)
    }

    pub fn exists_by_id(&self, spec: &TableSpec, id: i64) -> Result<bool> {
        self.exists_where(spec, "id = ?", &[&id])
    }

    pub fn delete_by_id(&self, spec: &TableSpec, id: i64) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?", spec.name);
        self.with_conn(|conn| {
            let removed = conn.execute(&sql, [id])?;
            Ok(removed > 0)
        })
    }

    /// Ids matching an optional filter with allowlisted ordering and
    /// limit/offset paging.
    pub fn find_ids(
        &self,
        spec: &TableSpec,
        where_clause: Option<&str>,
        params: &[&dyn ToSql],
        order_by: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<i64>> {
        let order = match order_by {
            Some(expr) => validated_order(spec, expr)?,
            None => "id ASC".to_string(),
        };
        let filter = where_clause
            .map(|clause| format!("WHERE {clause}"))
            .unwrap_or_default();
        let sql = format!(
            "SELECT id FROM {} {filter} ORDER BY {order} LIMIT {limit} OFFSET {offset}",
            spec.name
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(params, |row| row.get(0))?
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

    #[test]
    fn test_count_and_exists() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let folder = db.ensure_folder(project, "/lib", "lib", None).unwrap();
        for i in 0..3 {
            db.upsert_photo(
                &PathBuf::from(format!("/lib/{i}.jpg")),
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
        }

        assert_eq!(db.count_where(&PHOTOS, None, &[]).unwrap(), 3);
        assert_eq!(
            db.count_where(&PHOTOS, Some("project_id = ?"), &[&project])
                .unwrap(),
            3
        );
        assert!(db.exists_where(&PHOTOS, "path = ?", &[&"/lib/0.jpg"]).unwrap());
        assert!(!db.exists_where(&PHOTOS, "path = ?", &[&"/nope.jpg"]).unwrap());
    }

    #[test]
    fn test_find_ids_paging_and_order() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let folder = db.ensure_folder(project, "/lib", "lib", None).unwrap();
        let ids: Vec<i64> = (0..5)
            .map(|i| {
                db.upsert_photo(
                    &PathBuf::from(format!("/lib/{i}.jpg")),
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
            })
            .collect();

        let page = db
            .find_ids(&PHOTOS, None, &[], Some("id DESC"), 2, 1)
            .unwrap();
        assert_eq!(page, vec![ids[3], ids[2]]);
    }

    #[test]
    fn test_order_by_allowlist_rejects_injection() {
        let (_dir, db) = open_temp();
        assert!(db
            .find_ids(&PHOTOS, None, &[], Some("path; DROP TABLE tags"), 10, 0)
            .is_err());
        assert!(db
            .find_ids(&PHOTOS, None, &[], Some("metadata_status"), 10, 0)
            .is_err());
        assert!(db.find_ids(&PHOTOS, None, &[], Some("id DESC"), 10, 0).is_ok());
    }

    #[test]
    fn test_delete_by_id() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let tag = db.ensure_tag("x", project).unwrap();
        assert!(db.delete_by_id(&TAGS, tag).unwrap());
        assert!(!db.exists_by_id(&TAGS, tag).unwrap());
    }
}
