//! Raster store contract.
//!
//! A [`RasterStore`] reads raster metadata, warps rasters onto a common grid
//! and evaluates per-pixel functions over aligned bands. The pipeline only
//! talks to this trait; [`GeoTiffStore`](super::GeoTiffStore) is the bundled
//! implementation.

use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::info::{BoundingBox, DataType, PixelSize, RasterInfo};

/// Errors raised by raster stores and pixel functions.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode raster {path}: {message}")]
    Format { path: PathBuf, message: String },

    #[error("unsupported pixel type in {path}: {detail}")]
    UnsupportedDataType { path: PathBuf, detail: String },

    #[error("{path} has no band {band}")]
    MissingBand { path: PathBuf, band: usize },

    #[error("raster shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("bounding boxes of the input rasters do not overlap")]
    NoOverlap,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Resampling algorithm used when warping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResampleMethod {
    #[default]
    #[serde(rename = "near")]
    Nearest,
}

/// How the output extent of an alignment is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundingBoxMode {
    /// Area covered by every input.
    Intersection,
    /// Area covered by any input.
    Union,
    /// A fixed extent.
    Explicit(BoundingBox),
}

impl BoundingBoxMode {
    /// Resolves the output extent for the given inputs.
    pub fn resolve(&self, infos: &[RasterInfo]) -> Result<BoundingBox, StoreError> {
        if let Self::Explicit(bbox) = self {
            return if bbox.is_empty() {
                Err(StoreError::InvalidArgument(format!(
                    "empty bounding box {}",
                    bbox
                )))
            } else {
                Ok(*bbox)
            };
        }

        let (first, rest) = infos
            .split_first()
            .ok_or_else(|| StoreError::InvalidArgument("no input rasters".into()))?;
        let mut bbox = first.bounding_box;
        for info in rest {
            bbox = match self {
                Self::Intersection => bbox
                    .intersection(&info.bounding_box)
                    .ok_or(StoreError::NoOverlap)?,
                _ => bbox.union(&info.bounding_box),
            };
        }
        Ok(bbox)
    }
}

/// One band of a raster on disk (1-based band index).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterBand {
    pub path: PathBuf,
    pub band: usize,
}

impl RasterBand {
    pub fn new(path: impl Into<PathBuf>, band: usize) -> Self {
        Self {
            path: path.into(),
            band,
        }
    }

    /// The first band of `path`.
    pub fn first(path: impl Into<PathBuf>) -> Self {
        Self::new(path, 1)
    }
}

/// A function evaluated over aligned input bands, cell by cell.
///
/// Inputs are the band arrays in the order passed to
/// [`RasterStore::raster_calculator`]; the output must have the same shape.
pub trait PixelFunction: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Number of input bands the function expects.
    fn arity(&self) -> usize;

    /// Computes the output array.
    fn evaluate(&self, inputs: &[ArrayView2<'_, f64>]) -> Result<Array2<f64>, StoreError>;
}

/// Raster I/O and algebra used by the pipeline stages.
pub trait RasterStore: Send + Sync {
    /// Reads metadata of the first band of `path`.
    fn raster_info(&self, path: &Path) -> Result<RasterInfo, StoreError>;

    /// Resamples `source` onto the grid defined by `pixel_size` and
    /// `target_bbox`, writing `target`. Pixel type and nodata are preserved.
    fn warp(
        &self,
        source: &Path,
        pixel_size: PixelSize,
        target: &Path,
        resample: ResampleMethod,
        target_bbox: BoundingBox,
    ) -> Result<(), StoreError>;

    /// Aligns a stack of rasters onto one grid.
    ///
    /// Every `sources[i]` is warped to `targets[i]` using `resample[i]`, the
    /// common `pixel_size`, and an extent chosen by `bbox_mode`.
    fn align_and_resize(
        &self,
        sources: &[PathBuf],
        targets: &[PathBuf],
        resample: &[ResampleMethod],
        pixel_size: PixelSize,
        bbox_mode: BoundingBoxMode,
    ) -> Result<(), StoreError> {
        if sources.len() != targets.len() || sources.len() != resample.len() {
            return Err(StoreError::InvalidArgument(format!(
                "{} sources, {} targets and {} resample methods",
                sources.len(),
                targets.len(),
                resample.len()
            )));
        }

        let infos = sources
            .iter()
            .map(|s| self.raster_info(s))
            .collect::<Result<Vec<_>, _>>()?;
        let bbox = bbox_mode.resolve(&infos)?;
        debug!(rasters = sources.len(), bbox = %bbox, "Aligning raster stack");

        for ((source, target), method) in sources.iter().zip(targets).zip(resample) {
            self.warp(source, pixel_size, target, *method, bbox)?;
        }
        Ok(())
    }

    /// Evaluates `function` over `inputs` and writes a single-band raster.
    fn raster_calculator(
        &self,
        inputs: &[RasterBand],
        function: &dyn PixelFunction,
        output: &Path,
        dtype: DataType,
        nodata: f64,
    ) -> Result<(), StoreError>;
}
