//! Raster metadata, I/O contracts and the bundled GeoTIFF store.
//!
//! The pipeline depends only on [`RasterStore`] and [`PixelFunction`];
//! [`GeoTiffStore`] implements them for single-band GeoTIFFs with
//! nearest-neighbour resampling.

mod geotiff;
mod grid;
mod info;
mod store;

pub use geotiff::{read_grid, write_grid, GeoTiffStore};
pub use grid::{cells_for_extent, GeoTransform, Grid};
pub use info::{BoundingBox, DataType, PixelSize, RasterInfo};
pub use store::{
    BoundingBoxMode, PixelFunction, RasterBand, RasterStore, ResampleMethod, StoreError,
};
