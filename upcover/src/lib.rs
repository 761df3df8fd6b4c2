//! Upcover - upstream drainage coverage for hazard rasters
//!
//! For each configured hazard or vulnerability raster, upcover marks the
//! cells that drain into the raster's "channel" cells. The work runs as a
//! chain of geospatial stages on a dependency-ordered task graph that skips
//! stages whose outputs are already up to date.
//!
//! # Modules
//!
//! - [`graph`] - cached, parallel task graph
//! - [`raster`] - raster metadata, store contract and the GeoTIFF store
//! - [`routing`] - flow routing contract and the external-command router
//! - [`pipeline`] - stage chain, mask algebra and the pipeline driver
//! - [`config`] - INI configuration
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod graph;
pub mod logging;
pub mod pipeline;
pub mod raster;
pub mod routing;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
