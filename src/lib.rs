//! Personal media catalog engine.
//!
//! An embedded-SQLite index of photos and videos organized into projects,
//! with incremental scanning, sidebar aggregation, duplicate and stack
//! detection, face-cluster management, semantic search, and a persistent
//! background job queue. Presentation layers (GUI, thumbnailing, model
//! inference, geocoding providers) plug in through the capability traits in
//! [`extract`], [`geocode`], and [`indexer::discovery`].

pub mod aggregate;
pub mod config;
pub mod db;
pub mod dupes;
pub mod error;
pub mod extract;
pub mod faces;
pub mod geocode;
pub mod indexer;
pub mod jobs;
pub mod logging;
pub mod semantic;
pub mod sidecar;

pub use config::Config;
pub use db::CatalogDb;
pub use error::CatalogError;
