//! In-memory georeferenced grid.

use ndarray::Array2;
use rayon::prelude::*;

use super::info::{BoundingBox, DataType, PixelSize, RasterInfo};
use super::store::StoreError;

/// North-up affine transform from pixel to georeferenced coordinates.
///
/// ```text
/// x = origin_x + col * pixel_width
/// y = origin_y + row * pixel_height
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    /// X coordinate of the upper-left corner
    pub origin_x: f64,
    /// Y coordinate of the upper-left corner
    pub origin_y: f64,
    pub pixel_width: f64,
    /// Usually negative
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        }
    }

    /// Transform anchored at the upper-left corner of `bbox`.
    pub fn for_bounds(bbox: &BoundingBox, pixel_size: PixelSize) -> Self {
        let origin_y = if pixel_size.y < 0.0 {
            bbox.max_y
        } else {
            bbox.min_y
        };
        Self::new(bbox.min_x, origin_y, pixel_size.x, pixel_size.y)
    }

    /// Geographic coordinates of a pixel center.
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Fractional pixel coordinates `(col, row)` of a point.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }

    pub fn pixel_size(&self) -> PixelSize {
        PixelSize::new(self.pixel_width, self.pixel_height)
    }

    /// Extent of a `rows` x `cols` grid.
    pub fn bounds(&self, rows: usize, cols: usize) -> BoundingBox {
        let x0 = self.origin_x;
        let x1 = self.origin_x + cols as f64 * self.pixel_width;
        let y0 = self.origin_y;
        let y1 = self.origin_y + rows as f64 * self.pixel_height;
        BoundingBox::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }
}

/// Number of whole pixels of size `step` covering `extent`.
///
/// A small tolerance keeps exact multiples from gaining an extra cell to
/// floating point noise.
pub fn cells_for_extent(extent: f64, step: f64) -> usize {
    let cells = (extent / step.abs() - 1e-6).ceil();
    if cells.is_finite() && cells >= 1.0 {
        cells as usize
    } else {
        1
    }
}

/// A single band held in memory as `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub data: Array2<f64>,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    pub dtype: DataType,
}

impl Grid {
    pub fn new(data: Array2<f64>, transform: GeoTransform) -> Self {
        Self {
            data,
            transform,
            nodata: None,
            dtype: DataType::Float64,
        }
    }

    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows(), self.cols())
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.transform.bounds(self.rows(), self.cols())
    }

    pub fn info(&self) -> RasterInfo {
        RasterInfo {
            pixel_size: self.transform.pixel_size(),
            bounding_box: self.bounding_box(),
            nodata: self.nodata,
            dtype: self.dtype,
            rows: self.rows(),
            cols: self.cols(),
        }
    }

    /// Nearest-neighbour resample onto the grid covering `bbox` at `pixel_size`.
    ///
    /// Cells outside the source extent become nodata. A source without nodata
    /// is clamped to its edge instead.
    pub fn resample_nearest(
        &self,
        bbox: &BoundingBox,
        pixel_size: PixelSize,
    ) -> Result<Grid, StoreError> {
        let transform = GeoTransform::for_bounds(bbox, pixel_size);
        let rows = cells_for_extent(bbox.height(), pixel_size.y);
        let cols = cells_for_extent(bbox.width(), pixel_size.x);
        let (src_rows, src_cols) = self.shape();

        let values: Vec<f64> = (0..rows * cols)
            .into_par_iter()
            .map(|i| {
                let (x, y) = transform.pixel_center(i % cols, i / cols);
                let (col, row) = self.transform.geo_to_pixel(x, y);
                let (col, row) = (col.floor(), row.floor());
                let inside = col >= 0.0
                    && row >= 0.0
                    && (col as usize) < src_cols
                    && (row as usize) < src_rows;
                match (inside, self.nodata) {
                    (true, _) => self.data[[row as usize, col as usize]],
                    (false, Some(nodata)) => nodata,
                    (false, None) => {
                        let r = (row.max(0.0) as usize).min(src_rows - 1);
                        let c = (col.max(0.0) as usize).min(src_cols - 1);
                        self.data[[r, c]]
                    }
                }
            })
            .collect();

        let data = Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| StoreError::InvalidArgument(format!("resample shape: {}", e)))?;
        Ok(Grid {
            data,
            transform,
            nodata: self.nodata,
            dtype: self.dtype,
        })
    }
}
