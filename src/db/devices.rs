//! Mobile device import provenance: devices, sessions, per-file tracking.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::CatalogDb;

#[derive(Debug, Clone)]
pub struct MobileDevice {
    pub id: i64,
    pub device_uid: String,
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub serial: Option<String>,
    pub volume_guid: Option<String>,
    pub last_mount: Option<String>,
    pub files_imported_total: i64,
    pub bytes_imported_total: i64,
}

#[derive(Debug, Clone)]
pub struct ImportSession {
    pub id: i64,
    pub device_id: i64,
    pub project_id: Option<i64>,
    pub status: String,
    pub files_found: i64,
    pub files_imported: i64,
    pub files_skipped: i64,
    pub files_failed: i64,
    pub bytes_imported: i64,
    pub error: Option<String>,
}

/// Per-import statistics written when a session completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub files_found: i64,
    pub files_imported: i64,
    pub files_skipped: i64,
    pub files_failed: i64,
    pub bytes_imported: i64,
}

#[derive(Debug, Clone)]
pub struct DeviceFile {
    pub id: i64,
    pub device_id: i64,
    pub device_path: String,
    pub size: Option<i64>,
    pub mtime: Option<String>,
    pub content_hash: Option<String>,
    pub import_status: String,
    pub photo_id: Option<i64>,
    pub video_id: Option<i64>,
}

impl CatalogDb {
    /// Register a device by its stable uid. Re-seen devices update
    /// `last_seen`, name and mount; cumulative counters are preserved.
    pub fn register_device(
        &self,
        device_uid: &str,
        name: Option<&str>,
        device_type: Option<&str>,
        serial: Option<&str>,
        volume_guid: Option<&str>,
        mount: Option<&str>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO mobile_devices (device_uid, name, device_type, serial, volume_guid, last_mount)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(device_uid) DO UPDATE SET
                     name = COALESCE(excluded.name, name),
                     device_type = COALESCE(excluded.device_type, device_type),
                     serial = COALESCE(excluded.serial, serial),
                     volume_guid = COALESCE(excluded.volume_guid, volume_guid),
                     last_mount = COALESCE(excluded.last_mount, last_mount),
                     last_seen = datetime('now')",
                params![device_uid, name, device_type, serial, volume_guid, mount],
            )?;
            let id = conn.query_row(
                "SELECT id FROM mobile_devices WHERE device_uid = ?",
                [device_uid],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn device_by_uid(&self, device_uid: &str) -> Result<Option<MobileDevice>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, device_uid, name, device_type, serial, volume_guid, last_mount,
                            files_imported_total, bytes_imported_total
                     FROM mobile_devices WHERE device_uid = ?",
                    [device_uid],
                    |row| {
                        Ok(MobileDevice {
                            id: row.get(0)?,
                            device_uid: row.get(1)?,
                            name: row.get(2)?,
                            device_type: row.get(3)?,
                            serial: row.get(4)?,
                            volume_guid: row.get(5)?,
                            last_mount: row.get(6)?,
                            files_imported_total: row.get(7)?,
                            bytes_imported_total: row.get(8)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn create_import_session(&self, device_id: i64, project_id: Option<i64>) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO import_sessions (device_id, project_id) VALUES (?, ?)",
                params![device_id, project_id],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Close a session: write its stats and fold them into the device's
    /// cumulative counters, atomically.
    pub fn complete_import_session(
        &self,
        session_id: i64,
        stats: SessionStats,
        error: Option<&str>,
    ) -> Result<()> {
        let status = if error.is_some() { "failed" } else { "completed" };
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE import_sessions SET
                     completed_at = datetime('now'),
                     files_found = ?, files_imported = ?, files_skipped = ?,
                     files_failed = ?, bytes_imported = ?,
                     status = ?, error = ?
                 WHERE id = ?",
                params![
                    stats.files_found,
                    stats.files_imported,
                    stats.files_skipped,
                    stats.files_failed,
                    stats.bytes_imported,
                    status,
                    error,
                    session_id
                ],
            )?;
            tx.execute(
                "UPDATE mobile_devices SET
                     files_imported_total = files_imported_total + ?,
                     bytes_imported_total = bytes_imported_total + ?,
                     last_seen = datetime('now')
                 WHERE id = (SELECT device_id FROM import_sessions WHERE id = ?)",
                params![stats.files_imported, stats.bytes_imported, session_id],
            )?;
            Ok(())
        })
    }

    pub fn import_session(&self, session_id: i64) -> Result<Option<ImportSession>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, device_id, project_id, status, files_found, files_imported,
                            files_skipped, files_failed, bytes_imported, error
                     FROM import_sessions WHERE id = ?",
                    [session_id],
                    |row| {
                        Ok(ImportSession {
                            id: row.get(0)?,
                            device_id: row.get(1)?,
                            project_id: row.get(2)?,
                            status: row.get(3)?,
                            files_found: row.get(4)?,
                            files_imported: row.get(5)?,
                            files_skipped: row.get(6)?,
                            files_failed: row.get(7)?,
                            bytes_imported: row.get(8)?,
                            error: row.get(9)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Track a file seen on a device. Re-sightings refresh `last_seen` and
    /// stat fields but keep import status and links.
    pub fn device_file_seen(
        &self,
        device_id: i64,
        device_path: &str,
        size: Option<i64>,
        mtime: Option<&str>,
        content_hash: Option<&str>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO device_files (device_id, device_path, size, mtime, content_hash)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(device_id, device_path) DO UPDATE SET
                     size = COALESCE(excluded.size, size),
                     mtime = COALESCE(excluded.mtime, mtime),
                     content_hash = COALESCE(excluded.content_hash, content_hash),
                     last_seen = datetime('now')",
                params![device_id, device_path, size, mtime, content_hash],
            )?;
            let id = conn.query_row(
                "SELECT id FROM device_files WHERE device_id = ? AND device_path = ?",
                params![device_id, device_path],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    pub fn mark_device_file_imported(
        &self,
        device_id: i64,
        device_path: &str,
        import_session_id: i64,
        photo_id: Option<i64>,
        video_id: Option<i64>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE device_files SET
                     import_status = 'imported',
                     import_session_id = ?,
                     photo_id = ?,
                     video_id = ?,
                     last_seen = datetime('now')
                 WHERE device_id = ? AND device_path = ?",
                params![import_session_id, photo_id, video_id, device_id, device_path],
            )?;
            Ok(())
        })
    }

    pub fn device_files(
        &self,
        device_id: i64,
        import_status: Option<&str>,
    ) -> Result<Vec<DeviceFile>> {
        self.with_conn(|conn| {
            // NULL status matches every row.
            let mut stmt = conn.prepare(
                "SELECT id, device_id, device_path, size, mtime, content_hash,
                        import_status, photo_id, video_id
                 FROM device_files
                 WHERE device_id = ?1 AND (?2 IS NULL OR import_status = ?2)
                 ORDER BY device_path",
            )?;
            let rows = stmt
                .query_map(params![device_id, import_status], |row| {
                    Ok(DeviceFile {
                        id: row.get(0)?,
                        device_id: row.get(1)?,
                        device_path: row.get(2)?,
                        size: row.get(3)?,
                        mtime: row.get(4)?,
                        content_hash: row.get(5)?,
                        import_status: row.get(6)?,
                        photo_id: row.get(7)?,
                        video_id: row.get(8)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::open_temp;

    #[test]
    fn test_register_preserves_counters() {
        let (_dir, db) = open_temp();
        let id = db
            .register_device("uid-1", Some("Pixel"), Some("android"), None, None, Some("/mnt/pixel"))
            .unwrap();

        let session = db.create_import_session(id, None).unwrap();
        db.complete_import_session(
            session,
            SessionStats {
                files_found: 10,
                files_imported: 8,
                files_skipped: 1,
                files_failed: 1,
                bytes_imported: 4096,
            },
            None,
        )
        .unwrap();

        // Re-register the same device; totals must survive.
        let id2 = db
            .register_device("uid-1", None, None, None, None, None)
            .unwrap();
        assert_eq!(id, id2);
        let device = db.device_by_uid("uid-1").unwrap().unwrap();
        assert_eq!(device.files_imported_total, 8);
        assert_eq!(device.bytes_imported_total, 4096);
        assert_eq!(device.name.as_deref(), Some("Pixel"));
    }

    #[test]
    fn test_failed_session_records_error() {
        let (_dir, db) = open_temp();
        let device = db
            .register_device("uid-2", None, None, None, None, None)
            .unwrap();
        let session = db.create_import_session(device, None).unwrap();
        db.complete_import_session(session, SessionStats::default(), Some("cable unplugged"))
            .unwrap();

        let row = db.import_session(session).unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error.as_deref(), Some("cable unplugged"));
    }

    #[test]
    fn test_device_file_lifecycle() {
        let (_dir, db) = open_temp();
        let device = db
            .register_device("uid-3", None, None, None, None, None)
            .unwrap();
        db.device_file_seen(device, "DCIM/100/a.jpg", Some(1000), None, None)
            .unwrap();
        db.device_file_seen(device, "DCIM/100/a.jpg", Some(1000), Some("2024-01-01 00:00:00"), None)
            .unwrap();

        let seen = db.device_files(device, Some("seen")).unwrap();
        assert_eq!(seen.len(), 1);

        let session = db.create_import_session(device, None).unwrap();
        db.mark_device_file_imported(device, "DCIM/100/a.jpg", session, Some(42), None)
            .unwrap();
        let imported = db.device_files(device, Some("imported")).unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].photo_id, Some(42));
    }
}
