//! Feature extraction capability.
//!
//! The catalog core never decodes images or runs models on the hot path; it
//! consumes this trait. [`DefaultExtractor`] covers the cheap parts (EXIF,
//! dimensions, cryptographic and perceptual hashes). Face detection and
//! semantic embedding need an inference backend and must be injected by the
//! host application.

use anyhow::{anyhow, bail, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::db::faces::BoundingBox;

/// EXIF-derived attributes of one image.
#[derive(Debug, Clone, Default)]
pub struct ExifSummary {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Raw EXIF DateTimeOriginal string (`YYYY:MM:DD HH:MM:SS`).
    pub date_taken: Option<String>,
    pub gps: Option<(f64, f64)>,
}

/// One detected face with its embedding.
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub quality_score: f32,
}

/// Semantic embedding of one image under a named model.
#[derive(Debug, Clone)]
pub struct ImageEmbedding {
    /// L2-normalized vector.
    pub vec: Vec<f32>,
    pub norm: f32,
    /// Perceptual content hash of the source at embedding time.
    pub source_hash: String,
    pub source_mtime: Option<String>,
}

pub trait FeatureExtractor: Send + Sync {
    fn extract_exif(&self, path: &Path) -> Result<ExifSummary>;

    /// Perceptual hash of the decoded pixels (dHash family), base64-encoded.
    /// Stable across EXIF edits, which makes it the embedding staleness
    /// marker.
    fn perceptual_hash(&self, path: &Path) -> Result<String>;

    /// Strong cryptographic digest of the file bytes, hex-encoded.
    fn content_hash(&self, path: &Path) -> Result<String>;

    fn face_detect(&self, path: &Path) -> Result<Vec<FaceDetection>>;

    fn embed_image(&self, path: &Path, model: &str) -> Result<ImageEmbedding>;
}

/// Extractor for everything that does not need a model. Inference calls
/// fail loudly so misconfigured deployments surface immediately instead of
/// silently skipping work.
#[derive(Debug, Default)]
pub struct DefaultExtractor;

impl FeatureExtractor for DefaultExtractor {
    fn extract_exif(&self, path: &Path) -> Result<ExifSummary> {
        let mut summary = ExifSummary::default();

        if let Ok(reader) = image::ImageReader::open(path) {
            if let Ok(dims) = reader.into_dimensions() {
                summary.width = Some(dims.0);
                summary.height = Some(dims.1);
            }
        }

        if let Ok(file) = File::open(path) {
            let mut bufreader = BufReader::new(file);
            if let Ok(exif) = exif::Reader::new().read_from_container(&mut bufreader) {
                if let Some(field) = exif.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)
                {
                    summary.date_taken = Some(
                        field
                            .display_value()
                            .to_string()
                            .trim_matches('"')
                            .to_string(),
                    );
                }

                if let (Some(lat_field), Some(lat_ref), Some(lon_field), Some(lon_ref)) = (
                    exif.get_field(exif::Tag::GPSLatitude, exif::In::PRIMARY),
                    exif.get_field(exif::Tag::GPSLatitudeRef, exif::In::PRIMARY),
                    exif.get_field(exif::Tag::GPSLongitude, exif::In::PRIMARY),
                    exif.get_field(exif::Tag::GPSLongitudeRef, exif::In::PRIMARY),
                ) {
                    if let (exif::Value::Rational(lat_vals), exif::Value::Rational(lon_vals)) =
                        (&lat_field.value, &lon_field.value)
                    {
                        if lat_vals.len() >= 3 && lon_vals.len() >= 3 {
                            let lat = dms_to_decimal(
                                lat_vals[0].num as f64 / lat_vals[0].denom as f64,
                                lat_vals[1].num as f64 / lat_vals[1].denom as f64,
                                lat_vals[2].num as f64 / lat_vals[2].denom as f64,
                            );
                            let lon = dms_to_decimal(
                                lon_vals[0].num as f64 / lon_vals[0].denom as f64,
                                lon_vals[1].num as f64 / lon_vals[1].denom as f64,
                                lon_vals[2].num as f64 / lon_vals[2].denom as f64,
                            );
                            let lat_sign =
                                if lat_ref.display_value().to_string().contains('S') { -1.0 } else { 1.0 };
                            let lon_sign =
                                if lon_ref.display_value().to_string().contains('W') { -1.0 } else { 1.0 };
                            summary.gps = Some((lat * lat_sign, lon * lon_sign));
                        }
                    }
                }
            }
        }

        Ok(summary)
    }

    fn perceptual_hash(&self, path: &Path) -> Result<String> {
        use img_hash::HasherConfig;

        let img = image::open(path)?;

        // Small thumbnail first; hashing never needs full resolution.
        let thumbnail = img.thumbnail(64, 64);

        let hasher = HasherConfig::new().hash_size(16, 16).to_hasher();

        let rgba = thumbnail.to_rgba8();
        let (width, height) = rgba.dimensions();
        let img_hash_image = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())
            .ok_or_else(|| anyhow!("Failed to create image for hashing"))?;

        let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(img_hash_image));
        Ok(hash.to_base64())
    }

    fn content_hash(&self, path: &Path) -> Result<String> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();

        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    fn face_detect(&self, _path: &Path) -> Result<Vec<FaceDetection>> {
        bail!("face detection requires an inference-capable FeatureExtractor");
    }

    fn embed_image(&self, _path: &Path, _model: &str) -> Result<ImageEmbedding> {
        bail!("image embedding requires an inference-capable FeatureExtractor");
    }
}

/// Hamming distance between two base64-encoded perceptual hashes.
pub fn hamming_distance(hash1: &str, hash2: &str) -> Result<u32> {
    use img_hash::ImageHash;

    let h1 = ImageHash::<Box<[u8]>>::from_base64(hash1)
        .map_err(|e| anyhow!("Invalid hash1: {:?}", e))?;
    let h2 = ImageHash::<Box<[u8]>>::from_base64(hash2)
        .map_err(|e| anyhow!("Invalid hash2: {:?}", e))?;

    Ok(h1.dist(&h2))
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dms_to_decimal() {
        let dec = dms_to_decimal(52.0, 30.0, 0.0);
        assert!((dec - 52.5).abs() < 1e-9);
    }

    #[test]
    fn test_content_hash_of_known_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"abc").unwrap();

        let extractor = DefaultExtractor;
        let hash = extractor.content_hash(&path).unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_inference_calls_fail_loudly() {
        let extractor = DefaultExtractor;
        assert!(extractor.face_detect(Path::new("/x.jpg")).is_err());
        assert!(extractor.embed_image(Path::new("/x.jpg"), "m").is_err());
    }
}
