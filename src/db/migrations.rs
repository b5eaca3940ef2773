//! Forward-only schema migrations.
//!
//! Never edit or delete a migration after it ships. Fresh databases are
//! created from the consolidated DDL in `schema.rs` and start at the target
//! version; only databases created by older builds walk this list.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;

use crate::error::CatalogError;

use super::schema::SCHEMA_VERSION;

pub struct Migration {
    pub version: &'static str,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations in version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "2.0.0",
        description: "normalized date fields on photo/video metadata",
        sql: r#"
        ALTER TABLE photo_metadata ADD COLUMN created_ts INTEGER;
        ALTER TABLE photo_metadata ADD COLUMN created_date TEXT;
        ALTER TABLE photo_metadata ADD COLUMN created_year INTEGER;
        ALTER TABLE video_metadata ADD COLUMN created_ts INTEGER;
        ALTER TABLE video_metadata ADD COLUMN created_date TEXT;
        ALTER TABLE video_metadata ADD COLUMN created_year INTEGER;
        CREATE INDEX IF NOT EXISTS idx_meta_proj_year_date
            ON photo_metadata(project_id, created_year, created_date);
        CREATE INDEX IF NOT EXISTS idx_video_proj_year_date
            ON video_metadata(project_id, created_year, created_date);
        "#,
    },
    Migration {
        version: "3.0.0",
        description: "composite indexes for duplicate listing",
        sql: r#"
        CREATE INDEX IF NOT EXISTS idx_media_instance_asset_project
            ON media_instance(asset_id, project_id);
        CREATE INDEX IF NOT EXISTS idx_media_asset_hash
            ON media_asset(project_id, content_hash);
        "#,
    },
    Migration {
        version: "4.0.0",
        description: "search history and saved searches",
        sql: r#"
        CREATE TABLE IF NOT EXISTS search_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            query_type TEXT NOT NULL,
            query_text TEXT,
            query_image_path TEXT,
            result_count INTEGER NOT NULL DEFAULT 0,
            top_photo_ids TEXT,
            filters TEXT,
            execution_time_ms REAL NOT NULL DEFAULT 0,
            model TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE TABLE IF NOT EXISTS saved_search (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            query_type TEXT NOT NULL,
            query_text TEXT,
            query_image_path TEXT,
            filters TEXT,
            model TEXT,
            use_count INTEGER NOT NULL DEFAULT 0,
            last_used_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_search_history_created ON search_history(created_at);
        "#,
    },
    Migration {
        version: "5.0.0",
        description: "mobile device import provenance",
        sql: r#"
        CREATE TABLE IF NOT EXISTS mobile_devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_uid TEXT NOT NULL UNIQUE,
            name TEXT,
            device_type TEXT,
            serial TEXT,
            volume_guid TEXT,
            last_mount TEXT,
            first_seen TEXT NOT NULL DEFAULT (datetime('now')),
            last_seen TEXT NOT NULL DEFAULT (datetime('now')),
            files_imported_total INTEGER NOT NULL DEFAULT 0,
            bytes_imported_total INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS import_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            project_id INTEGER,
            started_at TEXT NOT NULL DEFAULT (datetime('now')),
            completed_at TEXT,
            files_found INTEGER NOT NULL DEFAULT 0,
            files_imported INTEGER NOT NULL DEFAULT 0,
            files_skipped INTEGER NOT NULL DEFAULT 0,
            files_failed INTEGER NOT NULL DEFAULT 0,
            bytes_imported INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'running',
            error TEXT,
            FOREIGN KEY (device_id) REFERENCES mobile_devices(id) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS device_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            device_path TEXT NOT NULL,
            size INTEGER,
            mtime TEXT,
            content_hash TEXT,
            import_status TEXT NOT NULL DEFAULT 'seen',
            photo_id INTEGER,
            video_id INTEGER,
            import_session_id INTEGER,
            first_seen TEXT NOT NULL DEFAULT (datetime('now')),
            last_seen TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (device_id) REFERENCES mobile_devices(id) ON DELETE CASCADE,
            UNIQUE (device_id, device_path)
        );
        CREATE INDEX IF NOT EXISTS idx_device_files_status ON device_files(device_id, import_status);
        CREATE INDEX IF NOT EXISTS idx_import_sessions_device ON import_sessions(device_id);
        "#,
    },
    Migration {
        version: "6.0.0",
        description: "background job queue and batch checkpoints",
        sql: r#"
        CREATE TABLE IF NOT EXISTS ml_job (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL DEFAULT '{}',
            backend TEXT,
            state TEXT NOT NULL DEFAULT 'queued'
                CHECK (state IN ('queued', 'running', 'succeeded', 'failed', 'canceled')),
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            started_at TEXT,
            finished_at TEXT,
            error TEXT
        );
        CREATE TABLE IF NOT EXISTS batch_checkpoints (
            checkpoint_key TEXT PRIMARY KEY,
            items_processed INTEGER NOT NULL DEFAULT 0,
            total_items INTEGER NOT NULL DEFAULT 0,
            last_item_index INTEGER NOT NULL DEFAULT 0,
            last_item_id TEXT,
            extra_data_json TEXT,
            saved_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_ml_job_state ON ml_job(state);
        "#,
    },
];

/// Outcome of one applied migration.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: String,
    pub description: String,
}

/// Current schema version of an open database.
///
/// - `0.0.0`: fresh database, no tables yet
/// - `1.0.0`: legacy database created before version tracking existed
/// - otherwise: newest row in `schema_version`
pub fn current_version(conn: &Connection) -> Result<String> {
    let has_photos: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='photo_metadata'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !has_photos {
        return Ok("0.0.0".to_string());
    }

    let has_version_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !has_version_table {
        return Ok("1.0.0".to_string());
    }

    let version: Option<String> = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY rowid DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok();
    Ok(version.unwrap_or_else(|| "1.0.0".to_string()))
}

/// Migrations that still need to be applied to a database at `current`.
///
/// Errors when `current` is not a version this build knows about, which
/// means the file was created by a newer build.
pub fn pending_migrations(current: &str) -> Result<&'static [Migration]> {
    if current == SCHEMA_VERSION {
        return Ok(&[]);
    }
    if current == "0.0.0" {
        // Fresh files get the consolidated DDL, not the migration walk.
        bail!("database is uninitialized; create the schema before migrating");
    }
    if current == "1.0.0" {
        return Ok(MIGRATIONS);
    }
    match MIGRATIONS.iter().position(|m| m.version == current) {
        Some(idx) => Ok(&MIGRATIONS[idx + 1..]),
        None => bail!(CatalogError::SchemaTooNew {
            found: current.to_string(),
            supported: SCHEMA_VERSION.to_string(),
        }),
    }
}

/// Apply all pending migrations, one transaction per migration, appending a
/// `schema_version` row after each.
pub fn apply_pending(conn: &mut Connection) -> Result<Vec<AppliedMigration>> {
    let current = current_version(conn)?;
    let pending = pending_migrations(&current)?;

    let mut applied = Vec::new();
    for migration in pending {
        let tx = conn
            .transaction()
            .with_context(|| CatalogError::Migration {
                version: migration.version.to_string(),
            })?;

        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )?;
        tx.execute_batch(migration.sql)
            .with_context(|| CatalogError::Migration {
                version: migration.version.to_string(),
            })?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?)",
            [migration.version],
        )?;
        tx.commit().with_context(|| CatalogError::Migration {
            version: migration.version.to_string(),
        })?;

        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Applied migration"
        );
        applied.push(AppliedMigration {
            version: migration.version.to_string(),
            description: migration.description.to_string(),
        });
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_end_at_target() {
        let last = MIGRATIONS.last().unwrap();
        assert_eq!(last.version, SCHEMA_VERSION);

        let mut versions: Vec<&str> = MIGRATIONS.iter().map(|m| m.version).collect();
        let sorted = versions.clone();
        versions.sort();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn test_pending_for_unknown_version_is_error() {
        assert!(pending_migrations("99.0.0").is_err());
    }

    #[test]
    fn test_pending_for_target_is_empty() {
        assert!(pending_migrations(SCHEMA_VERSION).unwrap().is_empty());
    }
}
