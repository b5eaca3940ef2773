//! Media stacks: versioned photo groupings for duplicates, near-duplicates,
//! visually similar sets, and bursts.

use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension, Transaction};
use std::fmt;
use std::str::FromStr;

use super::CatalogDb;
use crate::error::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackType {
    Duplicate,
    NearDuplicate,
    Similar,
    Burst,
}

impl StackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackType::Duplicate => "duplicate",
            StackType::NearDuplicate => "near_duplicate",
            StackType::Similar => "similar",
            StackType::Burst => "burst",
        }
    }
}

impl fmt::Display for StackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StackType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "duplicate" => Ok(StackType::Duplicate),
            "near_duplicate" => Ok(StackType::NearDuplicate),
            "similar" => Ok(StackType::Similar),
            "burst" => Ok(StackType::Burst),
            other => bail!("unknown stack type: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stack {
    pub stack_id: i64,
    pub project_id: i64,
    pub stack_type: StackType,
    pub representative_photo_id: Option<i64>,
    pub rule_version: String,
}

#[derive(Debug, Clone)]
pub struct StackMember {
    pub photo_id: i64,
    pub rank: i64,
    pub similarity_score: Option<f64>,
}

impl CatalogDb {
    /// Create a stack plus its params snapshot. Usually called inside the
    /// rebuild transaction via [`create_stack_tx`].
    pub fn create_stack(
        &self,
        project_id: i64,
        stack_type: StackType,
        representative_photo_id: Option<i64>,
        rule_version: &str,
        params_json: &str,
    ) -> Result<i64> {
        self.with_tx(|tx| {
            create_stack_tx(
                tx,
                project_id,
                stack_type,
                representative_photo_id,
                rule_version,
                params_json,
            )
        })
    }

    pub fn add_stack_member(
        &self,
        stack_id: i64,
        photo_id: i64,
        similarity_score: Option<f64>,
        rank: i64,
    ) -> Result<()> {
        self.with_tx(|tx| add_stack_member_tx(tx, stack_id, photo_id, similarity_score, rank))
    }

    pub fn stack_members(&self, stack_id: i64) -> Result<Vec<StackMember>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT photo_id, rank, similarity_score
                 FROM media_stack_member WHERE stack_id = ? ORDER BY rank",
            )?;
            let members = stmt
                .query_map([stack_id], |row| {
                    Ok(StackMember {
                        photo_id: row.get(0)?,
                        rank: row.get(1)?,
                        similarity_score: row.get(2)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(members)
        })
    }

    pub fn stack_meta(&self, stack_id: i64) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT params_json FROM media_stack_meta WHERE stack_id = ?",
                    [stack_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn stacks_for(
        &self,
        project_id: i64,
        stack_type: StackType,
        rule_version: &str,
    ) -> Result<Vec<Stack>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT stack_id, project_id, stack_type, representative_photo_id, rule_version
                 FROM media_stack
                 WHERE project_id = ? AND stack_type = ? AND rule_version = ?
                 ORDER BY stack_id",
            )?;
            let stacks = stmt
                .query_map(
                    params![project_id, stack_type.as_str(), rule_version],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )?
                .filter_map(|r| r.ok())
                .filter_map(|(id, project, kind, rep, version)| {
                    Some(Stack {
                        stack_id: id,
                        project_id: project,
                        stack_type: kind.parse().ok()?,
                        representative_photo_id: rep,
                        rule_version: version,
                    })
                })
                .collect();
            Ok(stacks)
        })
    }
}

/// Transaction-scoped creation used by the rebuild path so delete + insert
/// stay atomic.
pub fn create_stack_tx(
    tx: &Transaction,
    project_id: i64,
    stack_type: StackType,
    representative_photo_id: Option<i64>,
    rule_version: &str,
    params_json: &str,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO media_stack (project_id, stack_type, representative_photo_id, rule_version)
         VALUES (?, ?, ?, ?)",
        params![
            project_id,
            stack_type.as_str(),
            representative_photo_id,
            rule_version
        ],
    )?;
    let stack_id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO media_stack_meta (stack_id, params_json) VALUES (?, ?)",
        params![stack_id, params_json],
    )?;
    Ok(stack_id)
}

pub fn add_stack_member_tx(
    tx: &Transaction,
    stack_id: i64,
    photo_id: i64,
    similarity_score: Option<f64>,
    rank: i64,
) -> Result<()> {
    let stack_project: Option<i64> = tx
        .query_row(
            "SELECT project_id FROM media_stack WHERE stack_id = ?",
            [stack_id],
            |row| row.get(0),
        )
        .optional()?;
    let photo_project: Option<i64> = tx
        .query_row(
            "SELECT project_id FROM photo_metadata WHERE id = ?",
            [photo_id],
            |row| row.get(0),
        )
        .optional()?;
    match (stack_project, photo_project) {
        (Some(s), Some(p)) if s == p => {}
        (Some(s), p) => bail!(CatalogError::CrossProject {
            entity: "stack member",
            expected: s,
            found: p.unwrap_or(-1),
        }),
        (None, _) => bail!(CatalogError::NotFound {
            entity: "stack",
            key: stack_id.to_string(),
        }),
    }

    tx.execute(
        "INSERT INTO media_stack_member (stack_id, project_id, photo_id, rank, similarity_score)
         VALUES (?, ?, ?, ?, ?)",
        params![stack_id, stack_project, photo_id, rank, similarity_score],
    )?;
    Ok(())
}

/// Remove all stacks of one `(type, rule_version)` within a project.
/// Members and meta cascade.
pub fn delete_stacks_tx(
    tx: &Transaction,
    project_id: i64,
    stack_type: StackType,
    rule_version: &str,
) -> Result<usize> {
    let removed = tx.execute(
        "DELETE FROM media_stack
         WHERE project_id = ? AND stack_type = ? AND rule_version = ?",
        params![project_id, stack_type.as_str(), rule_version],
    )?;
    Ok(removed)
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
    fn test_stack_members_ranked() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let a = add_photo(&db, project, "a.jpg");
        let b = add_photo(&db, project, "b.jpg");

        let stack = db
            .create_stack(project, StackType::Duplicate, Some(a), "1", "{}")
            .unwrap();
        db.add_stack_member(stack, a, Some(1.0), 1).unwrap();
        db.add_stack_member(stack, b, Some(1.0), 2).unwrap();

        let members = db.stack_members(stack).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].photo_id, a);
        assert_eq!(members[0].rank, 1);
        assert_eq!(db.stack_meta(stack).unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_duplicate_rank_rejected() {
        let (_dir, db) = open_temp();
        let project = make_project(&db, "p");
        let a = add_photo(&db, project, "a.jpg");
        let b = add_photo(&db, project, "b.jpg");

        let stack = db
            .create_stack(project, StackType::Burst, None, "1", "{}")
            .unwrap();
        db.add_stack_member(stack, a, None, 1).unwrap();
        assert!(db.add_stack_member(stack, b, None, 1).is_err());
    }

    #[test]
    fn test_cross_project_member_rejected() {
        let (_dir, db) = open_temp();
        let p1 = make_project(&db, "p1");
        let p2 = make_project(&db, "p2");
        let foreign = add_photo(&db, p2, "x.jpg");

        let stack = db
            .create_stack(p1, StackType::Similar, None, "1", "{}")
            .unwrap();
        assert!(db.add_stack_member(stack, foreign, None, 1).is_err());
    }

    #[test]
    fn test_stack_type_round_trip() {
        for t in [
            StackType::Duplicate,
            StackType::NearDuplicate,
            StackType::Similar,
            StackType::Burst,
        ] {
            assert_eq!(t.as_str().parse::<StackType>().unwrap(), t);
        }
    }
}
