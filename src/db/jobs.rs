//! Job queue rows and batch checkpoints.
//!
//! Enqueue refuses to run when the `ml_job` table is absent instead of
//! creating it on the fly; tables only come from migrations.

use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::str::FromStr;

use super::{table_exists, CatalogDb};
use crate::error::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "canceled" => Ok(JobState::Canceled),
            other => bail!("unknown job state: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub kind: String,
    pub payload_json: String,
    pub backend: Option<String>,
    pub state: JobState,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub checkpoint_key: String,
    pub items_processed: i64,
    pub total_items: i64,
    pub last_item_index: i64,
    pub last_item_id: Option<String>,
    pub extra_data_json: Option<String>,
    pub saved_at: String,
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    let state: String = row.get(4)?;
    Ok(JobRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        payload_json: row.get(2)?,
        backend: row.get(3)?,
        state: state.parse().unwrap_or(JobState::Failed),
        created_at: row.get(5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
        error: row.get(8)?,
    })
}

const JOB_COLS: &str =
    "id, kind, payload_json, backend, state, created_at, started_at, finished_at, error";

impl CatalogDb {
    /// Queue a job. Fails with a migration hint when the table is missing.
    pub fn enqueue_job(
        &self,
        kind: &str,
        payload_json: &str,
        backend: Option<&str>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            if !table_exists(conn, "ml_job")? {
                bail!(CatalogError::MissingTable("ml_job"));
            }
            conn.execute(
                "INSERT INTO ml_job (kind, payload_json, backend) VALUES (?, ?, ?)",
                params![kind, payload_json, backend],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn job_by_id(&self, job_id: i64) -> Result<Option<JobRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {JOB_COLS} FROM ml_job WHERE id = ?"),
                    [job_id],
                    job_from_row,
                )
                .optional()?)
        })
    }

    /// Sweep rows a crashed worker left in `running` to `failed`.
    pub fn recover_zombie_jobs(&self) -> Result<usize> {
        self.with_conn(|conn| {
            if !table_exists(conn, "ml_job")? {
                return Ok(0);
            }
            let swept = conn.execute(
                "UPDATE ml_job SET
                     state = 'failed',
                     finished_at = datetime('now'),
                     error = 'zombie recovery'
                 WHERE state = 'running'",
                [],
            )?;
            if swept > 0 {
                tracing::warn!(swept, "Recovered zombie jobs at startup");
            }
            Ok(swept)
        })
    }

    /// Atomically claim the oldest queued job, moving it to `running`.
    pub fn claim_next_job(&self) -> Result<Option<JobRow>> {
        self.with_tx(|tx| {
            let id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM ml_job WHERE state = 'queued' ORDER BY id LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = id else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE ml_job SET state = 'running', started_at = datetime('now') WHERE id = ?",
                [id],
            )?;
            let job = tx.query_row(
                &format!("SELECT {JOB_COLS} FROM ml_job WHERE id = ?"),
                [id],
                job_from_row,
            )?;
            Ok(Some(job))
        })
    }

    pub fn finish_job(&self, job_id: i64, error: Option<&str>) -> Result<()> {
        let state = if error.is_some() { "failed" } else { "succeeded" };
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE ml_job SET state = ?, finished_at = datetime('now'), error = ? WHERE id = ?",
                params![state, error, job_id],
            )?;
            Ok(())
        })
    }

    /// Cancel a queued job. Running jobs are stopped by their worker's
    /// cancellation flag, not here.
    pub fn cancel_job(&self, job_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE ml_job SET state = 'canceled', finished_at = datetime('now')
                 WHERE id = ? AND state = 'queued'",
                [job_id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn job_counts(&self) -> Result<Vec<(String, i64)>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT state, COUNT(*) FROM ml_job GROUP BY state ORDER BY state")?;
            let counts = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(counts)
        })
    }

    // ========================================================================
    // Batch checkpoints
    // ========================================================================

    pub fn save_checkpoint(
        &self,
        checkpoint_key: &str,
        items_processed: i64,
        total_items: i64,
        last_item_index: i64,
        last_item_id: Option<&str>,
        extra_data_json: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO batch_checkpoints
                     (checkpoint_key, items_processed, total_items, last_item_index,
                      last_item_id, extra_data_json, saved_at)
                 VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
                 ON CONFLICT(checkpoint_key) DO UPDATE SET
                     items_processed = excluded.items_processed,
                     total_items = excluded.total_items,
                     last_item_index = excluded.last_item_index,
                     last_item_id = excluded.last_item_id,
                     extra_data_json = excluded.extra_data_json,
                     saved_at = excluded.saved_at",
                params![
                    checkpoint_key,
                    items_processed,
                    total_items,
                    last_item_index,
                    last_item_id,
                    extra_data_json
                ],
            )?;
            Ok(())
        })
    }

    pub fn load_checkpoint(&self, checkpoint_key: &str) -> Result<Option<CheckpointRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT checkpoint_key, items_processed, total_items, last_item_index,
                            last_item_id, extra_data_json, saved_at
                     FROM batch_checkpoints WHERE checkpoint_key = ?",
                    [checkpoint_key],
                    |row| {
                        Ok(CheckpointRow {
                            checkpoint_key: row.get(0)?,
                            items_processed: row.get(1)?,
                            total_items: row.get(2)?,
                            last_item_index: row.get(3)?,
                            last_item_id: row.get(4)?,
                            extra_data_json: row.get(5)?,
                            saved_at: row.get(6)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn clear_checkpoint(&self, checkpoint_key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM batch_checkpoints WHERE checkpoint_key = ?",
                [checkpoint_key],
            )?;
            Ok(removed > 0)
        })
    }
}
