//! Reverse geocoding capability with a mandatory local cache.
//!
//! The core never talks to a geocoding service itself; hosts inject a
//! [`Geocoder`]. [`CachedGeocoder`] wraps any implementation with a cache
//! keyed by rounded coordinates so nearby photos resolve with one lookup.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// Coordinates are rounded to this many decimal places for cache keys
/// (about 11 m of latitude at 4 decimals).
const CACHE_PRECISION: i32 = 4;

pub trait Geocoder: Send + Sync {
    /// Resolve a human-readable place name, or None when unknown.
    fn reverse(&self, lat: f64, lon: f64) -> Result<Option<String>>;
}

/// Rounded cache key for a coordinate pair.
pub fn cache_key(lat: f64, lon: f64) -> (i64, i64) {
    let factor = 10f64.powi(CACHE_PRECISION);
    ((lat * factor).round() as i64, (lon * factor).round() as i64)
}

pub struct CachedGeocoder<G> {
    inner: G,
    cache: Mutex<HashMap<(i64, i64), Option<String>>>,
}

impl<G: Geocoder> CachedGeocoder<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

impl<G: Geocoder> Geocoder for CachedGeocoder<G> {
    fn reverse(&self, lat: f64, lon: f64) -> Result<Option<String>> {
        let key = cache_key(lat, lon);
        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        let name = self.inner.reverse(lat, lon)?;
        self.cache.lock().unwrap().insert(key, name.clone());
        Ok(name)
    }
}

/// Geocoder that resolves nothing. Used when the host has no provider;
/// location buckets then fall back to raw coordinates.
#[derive(Debug, Default)]
pub struct NullGeocoder;

impl Geocoder for NullGeocoder {
    fn reverse(&self, _lat: f64, _lon: f64) -> Result<Option<String>> {
        Ok(None)
    }
}
