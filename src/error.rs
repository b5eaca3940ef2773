//! Typed error kinds for catalog contract violations.
//!
//! Most APIs return `anyhow::Result`; these variants exist so callers can
//! distinguish the failures that have defined recovery paths (missing
//! migrations, cross-project assignments) from plain I/O trouble.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// A table the caller depends on is absent. The fix is always the same:
    /// run the migration CLI, never create tables ad hoc.
    #[error("required table '{0}' is missing - run `mediatheca migrate` to bring the schema up to date")]
    MissingTable(&'static str),

    #[error("migration {version} failed")]
    Migration { version: String },

    #[error("database schema version {found} is newer than this build supports (max {supported})")]
    SchemaTooNew { found: String, supported: String },

    #[error("cross-project assignment: {entity} belongs to project {found}, expected project {expected}")]
    CrossProject {
        entity: &'static str,
        expected: i64,
        found: i64,
    },

    #[error("invalid bounding box {x},{y} {w}x{h} for face crop in {image_path}")]
    InvalidBbox {
        image_path: String,
        x: i64,
        y: i64,
        w: i64,
        h: i64,
    },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
}
