mod schema;

pub mod assets;
pub mod base;
pub mod devices;
pub mod embeddings;
pub mod faces;
pub mod folders;
pub mod jobs;
pub mod migrations;
pub mod photos;
pub mod projects;
pub mod search;
pub mod stacks;
pub mod tags;
pub mod videos;

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OpenFlags, Transaction};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

pub use schema::{EXPECTED_TABLES, SCHEMA, SCHEMA_VERSION};

/// Connections kept alive per thread before LRU eviction kicks in.
const POOL_CAPACITY: usize = 4;

/// Busy timeout applied to every connection.
const BUSY_TIMEOUT_MS: u64 = 10_000;

static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<CatalogDb>>>> = OnceLock::new();

thread_local! {
    // Per-thread connection pool, most recently used first. Connections are
    // never shared across threads.
    static POOL: RefCell<Vec<PooledConn>> = const { RefCell::new(Vec::new()) };
}

struct PooledConn {
    path: PathBuf,
    read_only: bool,
    conn: Connection,
}

/// Handle to one catalog database file.
///
/// `open` returns a process-wide singleton per normalized absolute path, so
/// scanners, workers and the UI process all share one handle. The handle is
/// cheap to clone (`Arc`) and safe to use from any thread; actual
/// connections live in per-thread pools.
pub struct CatalogDb {
    path: PathBuf,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Arc<CatalogDb>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Normalize a database path for registry lookup. Relative paths resolve
/// against the current directory so worker threads with different working
/// directories still land on the same handle.
fn normalize_db_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

impl CatalogDb {
    /// Open (or fetch the already-open handle for) the database at `path`.
    ///
    /// With `auto_init` the schema is created or migrated as needed; any
    /// failure during initialization discards the handle.
    pub fn open(path: impl AsRef<Path>, auto_init: bool) -> Result<Arc<CatalogDb>> {
        let norm = normalize_db_path(path.as_ref());

        if let Some(existing) = registry().lock().unwrap().get(&norm) {
            return Ok(existing.clone());
        }

        if let Some(parent) = norm.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Arc::new(CatalogDb { path: norm.clone() });
        if auto_init {
            db.ensure_schema()?;
        }

        let mut map = registry().lock().unwrap();
        // Another thread may have won the race; keep the first handle.
        Ok(map.entry(norm).or_insert(db).clone())
    }

    /// Drop all registered handles. Pooled connections are closed as their
    /// threads next touch the pool or exit.
    pub fn close_all() {
        registry().lock().unwrap().clear();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_connection(&self, read_only: bool) -> Result<Connection> {
        let conn = if read_only {
            Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(&self.path)?
        };
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        if !read_only {
            // DELETE mode: WAL showed cross-thread visibility problems for
            // freshly created tables in the predecessor of this engine.
            let _ = conn.pragma_update(None, "journal_mode", "DELETE");
        }
        Ok(conn)
    }

    fn checkout(&self, read_only: bool) -> Result<Connection> {
        let pooled = POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            pool.iter()
                .position(|p| p.path == self.path && p.read_only == read_only)
                .map(|idx| pool.remove(idx).conn)
        });

        if let Some(conn) = pooled {
            // Trivial read detects broken connections; replace silently.
            match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
                Ok(_) => return Ok(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "Pooled connection broken, opening a fresh one");
                }
            }
        }

        self.open_connection(read_only)
    }

    fn checkin(&self, read_only: bool, conn: Connection) {
        POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            pool.insert(
                0,
                PooledConn {
                    path: self.path.clone(),
                    read_only,
                    conn,
                },
            );
            while pool.len() > POOL_CAPACITY {
                pool.pop();
            }
        });
    }

    /// Run `f` with a pooled writable connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.checkout(false)?;
        let result = f(&mut conn);
        self.checkin(false, conn);
        result
    }

    /// Run `f` with a pooled read-only connection.
    pub fn with_read_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.checkout(true)?;
        let result = f(&conn);
        self.checkin(true, conn);
        result
    }

    /// Run `f` inside a transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Execute a multi-statement DDL script inside one transaction.
    pub fn script(&self, sql: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute_batch(sql)?;
            Ok(())
        })
    }

    /// Latest applied version from `schema_version`.
    pub fn version(&self) -> Result<String> {
        self.with_conn(|conn| migrations::current_version(conn))
    }

    /// False when any expected table is missing. Missing indexes are logged
    /// as warnings but do not fail validation.
    pub fn validate_schema(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let present: std::collections::HashSet<String> = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();

            let mut ok = true;
            for table in EXPECTED_TABLES {
                if !present.contains(*table) {
                    tracing::error!(table = *table, "Expected table is missing");
                    ok = false;
                }
            }

            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type = 'index'")?;
            let indexes: std::collections::HashSet<String> = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            for idx in ["idx_meta_proj_folder", "idx_meta_proj_year_date"] {
                if !indexes.contains(idx) {
                    tracing::warn!(index = idx, "Expected index is missing");
                }
            }

            Ok(ok)
        })
    }

    /// Schema initialization. Fresh file gets the full DDL; older files are
    /// migrated in version order; up-to-date files are untouched.
    pub fn initialize(&self) -> Result<()> {
        self.ensure_schema()
    }

    fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.open_connection(false)?;
        let current = migrations::current_version(&conn)?;

        if current == "0.0.0" {
            tracing::info!(version = SCHEMA_VERSION, "Creating fresh catalog schema");
            let tx = conn.transaction()?;
            tx.execute_batch(SCHEMA)?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_version (version) VALUES (?)",
                [SCHEMA_VERSION],
            )?;
            tx.commit()?;
            drop(conn);

            // Verify with a new connection that the schema is visible.
            let verify = self.open_connection(false)?;
            if !table_exists(&verify, "photo_metadata")? {
                bail!("schema creation failed: photo_metadata table not found after init");
            }
        } else if current != SCHEMA_VERSION {
            tracing::info!(from = %current, to = SCHEMA_VERSION, "Migrating catalog schema");
            migrations::apply_pending(&mut conn)
                .with_context(|| format!("migrating schema from {current}"))?;
        }

        Ok(())
    }
}

/// Check whether a table exists on this connection.
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            [name],
            |_| Ok(true),
        )
        .unwrap_or(false);
    Ok(exists)
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Fresh initialized database in a tempdir. The tempdir guard must be
    /// kept alive by the caller.
    pub fn open_temp() -> (tempfile::TempDir, Arc<CatalogDb>) {
        let dir = tempfile::tempdir().unwrap();
        let db = CatalogDb::open(dir.path().join("catalog.db"), true).unwrap();
        (dir, db)
    }

    /// Minimal project row for repository tests.
    pub fn make_project(db: &CatalogDb, name: &str) -> i64 {
        db.create_project(name, "/library", "clip-vit-b32").unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_is_singleton_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        let a = CatalogDb::open(&path, true).unwrap();
        let b = CatalogDb::open(&path, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_fresh_schema_is_valid_and_versioned() {
        let (_dir, db) = test_util::open_temp();
        assert!(db.validate_schema().unwrap());
        assert_eq!(db.version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_tx_rolls_back_on_error() {
        let (_dir, db) = test_util::open_temp();
        let result: Result<()> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO projects (name, folder) VALUES ('p', '/p')",
                [],
            )?;
            bail!("forced failure")
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_script_runs_batch() {
        let (_dir, db) = test_util::open_temp();
        db.script("CREATE TABLE scratch (id INTEGER); INSERT INTO scratch VALUES (1);")
            .unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM scratch", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
