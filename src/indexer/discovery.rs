//! Filesystem enumeration capability.

use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One file found under the scan root.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time as `YYYY-MM-DDTHH:MM:SS` UTC.
    pub mtime: Option<String>,
}

/// Yields media files under a root, filtered by an extension allowlist.
pub trait Scanner: Send + Sync {
    fn walk(&self, root: &Path, extensions: &[String]) -> Result<Vec<ScannedFile>>;
}

pub struct WalkdirScanner {
    pub follow_symlinks: bool,
}

impl Default for WalkdirScanner {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
        }
    }
}

impl Scanner for WalkdirScanner {
    fn walk(&self, root: &Path, extensions: &[String]) -> Result<Vec<ScannedFile>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(root)
            .follow_links(self.follow_symlinks)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let Some(ext) = path.extension() else {
                continue;
            };
            let ext_lower = ext.to_string_lossy().to_lowercase();
            if !extensions.iter().any(|e| e.to_lowercase() == ext_lower) {
                continue;
            }

            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let mtime = metadata.modified().ok().map(|t| {
                let datetime: chrono::DateTime<chrono::Utc> = t.into();
                datetime.format("%Y-%m-%dT%H:%M:%S").to_string()
            });

            files.push(ScannedFile {
                path: path.to_path_buf(),
                size: metadata.len(),
                mtime,
            });
        }

        // Sort by path for consistent ordering
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_walk_filters_extensions() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let scanner = WalkdirScanner::default();
        let extensions = vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()];
        let files = scanner.walk(dir.path(), &extensions).unwrap();

        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|f| f.mtime.is_some()));
    }
}
