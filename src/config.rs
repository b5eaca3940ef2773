//! Application configuration.
//!
//! Loaded from a TOML file in the platform config directory. Every section
//! has sensible defaults so a missing file or missing keys never block
//! startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scanner: ScannerConfig,
    pub metadata: MetadataConfig,
    pub thumbnails: ThumbnailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the catalog database. Defaults to the platform data directory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub photo_extensions: Vec<String>,
    pub video_extensions: Vec<String>,
    pub follow_symlinks: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            photo_extensions: ["jpg", "jpeg", "png", "bmp", "webp", "heic", "tif", "tiff"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            video_extensions: ["mp4", "mov", "avi", "mkv", "m4v"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            follow_symlinks: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Retries before a row is marked permanently failed.
    pub max_failures: u32,
    /// Wall-clock budget per file for the external extractor.
    pub extract_timeout_secs: u64,
    /// Rows per backfill pass.
    pub backfill_batch: usize,
    /// Hashing worker threads; 0 means one per core.
    pub hash_workers: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            extract_timeout_secs: 6,
            backfill_batch: 200,
            hash_workers: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Maximum entries in the in-memory thumbnail LRU.
    pub cache_size: usize,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self { cache_size: 512 }
    }
}

impl Config {
    /// Platform config directory for mediatheca.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mediatheca")
    }

    /// Platform data directory (database, face crops, logs).
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mediatheca")
    }

    fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)?;
        std::fs::write(&path, raw)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Resolved database path.
    pub fn db_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("catalog.db"))
    }

    /// Directory holding face crop PNGs, next to the database file.
    pub fn face_crops_dir(&self) -> PathBuf {
        self.db_path()
            .parent()
            .map(|p| p.join("face_crops"))
            .unwrap_or_else(|| PathBuf::from("face_crops"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.scanner.photo_extensions.contains(&"jpg".to_string()));
        assert_eq!(config.metadata.max_failures, 3);
        assert_eq!(config.metadata.extract_timeout_secs, 6);
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(
            parsed.scanner.photo_extensions,
            config.scanner.photo_extensions
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("[metadata]\nmax_failures = 5\n").unwrap();
        assert_eq!(parsed.metadata.max_failures, 5);
        assert_eq!(parsed.metadata.backfill_batch, 200);
        assert!(!parsed.scanner.photo_extensions.is_empty());
    }
}
