//! Single-band GeoTIFF raster store.
//!
//! Georeferencing is carried in the ModelPixelScale (33550) and
//! ModelTiepoint (33922) tags, nodata in the GDAL_NODATA ASCII tag (42113).
//! Rotated transforms, projections and multi-band files are not supported.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::{
    ColorType, Gray16, Gray32, Gray32Float, Gray64Float, Gray8, GrayI16, GrayI32,
};
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;
use tracing::debug;

use super::grid::{GeoTransform, Grid};
use super::info::{BoundingBox, DataType, PixelSize, RasterInfo};
use super::store::{PixelFunction, RasterBand, RasterStore, ResampleMethod, StoreError};

// The decoder resolves these codes to named variants, so lookups must use
// the same variants.
const MODEL_PIXEL_SCALE: Tag = Tag::ModelPixelScaleTag;
const MODEL_TIEPOINT: Tag = Tag::ModelTiepointTag;
const GEO_KEY_DIRECTORY: Tag = Tag::GeoKeyDirectoryTag;
const GDAL_NODATA: Tag = Tag::GdalNodata;

fn format_error(path: &Path, err: impl std::fmt::Display) -> StoreError {
    StoreError::Format {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// =============================================================================
// Reading
// =============================================================================

/// Reads the first band of a GeoTIFF.
pub fn read_grid(path: &Path) -> Result<Grid, StoreError> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| format_error(path, e))?;

    match decoder.colortype().map_err(|e| format_error(path, e))? {
        tiff::ColorType::Gray(_) => {}
        other => {
            return Err(StoreError::UnsupportedDataType {
                path: path.to_path_buf(),
                detail: format!("{:?} (only single-band grayscale is supported)", other),
            })
        }
    }

    let (width, height) = decoder.dimensions().map_err(|e| format_error(path, e))?;
    let (rows, cols) = (height as usize, width as usize);

    let transform = read_geotransform(&mut decoder)
        .unwrap_or_else(|| GeoTransform::new(0.0, rows as f64, 1.0, -1.0));
    let nodata = decoder
        .get_tag_ascii_string(GDAL_NODATA)
        .ok()
        .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok());

    let image = decoder.read_image().map_err(|e| format_error(path, e))?;
    let (dtype, values): (DataType, Vec<f64>) = match image {
        DecodingResult::U8(buf) => (DataType::Byte, buf.into_iter().map(f64::from).collect()),
        DecodingResult::I8(buf) => (DataType::Int16, buf.into_iter().map(f64::from).collect()),
        DecodingResult::U16(buf) => (DataType::UInt16, buf.into_iter().map(f64::from).collect()),
        DecodingResult::I16(buf) => (DataType::Int16, buf.into_iter().map(f64::from).collect()),
        DecodingResult::U32(buf) => (DataType::UInt32, buf.into_iter().map(f64::from).collect()),
        DecodingResult::I32(buf) => (DataType::Int32, buf.into_iter().map(f64::from).collect()),
        DecodingResult::F32(buf) => (DataType::Float32, buf.into_iter().map(f64::from).collect()),
        DecodingResult::F64(buf) => (DataType::Float64, buf),
        _ => {
            return Err(StoreError::UnsupportedDataType {
                path: path.to_path_buf(),
                detail: "64-bit integer samples".into(),
            })
        }
    };

    let data = Array2::from_shape_vec((rows, cols), values).map_err(|e| format_error(path, e))?;
    debug!(path = %path.display(), rows, cols, dtype = %dtype, "Read raster");

    Ok(Grid::new(data, transform)
        .with_nodata(nodata.map(|v| dtype.cast(v)))
        .with_dtype(dtype))
}

fn read_geotransform<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    let scale = decoder.get_tag_f64_vec(MODEL_PIXEL_SCALE).ok()?;
    let tiepoint = decoder.get_tag_f64_vec(MODEL_TIEPOINT).ok()?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return None;
    }
    // tiepoint: [I, J, K, X, Y, Z], scale: [ScaleX, ScaleY, ScaleZ]
    let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
    let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
    Some(GeoTransform::new(origin_x, origin_y, scale[0], -scale[1]))
}

// =============================================================================
// Writing
// =============================================================================

/// Writes `grid` as a single-band GeoTIFF of `grid.dtype`.
///
/// The file is written next to `path` and renamed into place, so a partial
/// write never leaves a file at `path`.
pub fn write_grid(path: &Path, grid: &Grid) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    let partial = partial_path(path);
    let result = write_to(&partial, grid);
    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, path).map_err(|e| io_error(path, e))?;

    debug!(
        path = %path.display(),
        rows = grid.rows(),
        cols = grid.cols(),
        dtype = %grid.dtype,
        "Wrote raster"
    );
    Ok(())
}

fn write_to(path: &Path, grid: &Grid) -> Result<(), StoreError> {
    let file = File::create(path).map_err(|e| io_error(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(|e| format_error(path, e))?;

    let values = grid.data.iter().copied();
    let result = match grid.dtype {
        DataType::Byte => {
            encode::<Gray8, _>(&mut encoder, grid, &values.map(|v| v as u8).collect::<Vec<_>>())
        }
        DataType::Int16 => {
            encode::<GrayI16, _>(&mut encoder, grid, &values.map(|v| v as i16).collect::<Vec<_>>())
        }
        DataType::UInt16 => {
            encode::<Gray16, _>(&mut encoder, grid, &values.map(|v| v as u16).collect::<Vec<_>>())
        }
        DataType::Int32 => {
            encode::<GrayI32, _>(&mut encoder, grid, &values.map(|v| v as i32).collect::<Vec<_>>())
        }
        DataType::UInt32 => {
            encode::<Gray32, _>(&mut encoder, grid, &values.map(|v| v as u32).collect::<Vec<_>>())
        }
        DataType::Float32 => encode::<Gray32Float, _>(
            &mut encoder,
            grid,
            &values.map(|v| v as f32).collect::<Vec<_>>(),
        ),
        DataType::Float64 => {
            encode::<Gray64Float, _>(&mut encoder, grid, &values.collect::<Vec<_>>())
        }
    };
    result.map_err(|e| format_error(path, e))
}

fn encode<C, W>(
    encoder: &mut TiffEncoder<W>,
    grid: &Grid,
    data: &[C::Inner],
) -> tiff::TiffResult<()>
where
    C: ColorType,
    [C::Inner]: TiffValue,
    W: Write + Seek,
{
    let mut image = encoder.new_image::<C>(grid.cols() as u32, grid.rows() as u32)?;

    let gt = grid.transform;
    let scale = [gt.pixel_width, gt.pixel_height.abs(), 0.0];
    image.encoder().write_tag(MODEL_PIXEL_SCALE, &scale[..])?;
    let tiepoint = [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0];
    image.encoder().write_tag(MODEL_TIEPOINT, &tiepoint[..])?;

    // Version 1.1.0 with two keys: projected model, pixel-is-area.
    let geokeys: [u16; 12] = [1, 1, 0, 2, 1024, 0, 1, 1, 1025, 0, 1, 1];
    image.encoder().write_tag(GEO_KEY_DIRECTORY, &geokeys[..])?;

    if let Some(nodata) = grid.nodata {
        let text = format_nodata(nodata);
        image.encoder().write_tag(GDAL_NODATA, text.as_str())?;
    }

    image.write_data(data)
}

fn format_nodata(nodata: f64) -> String {
    if nodata.is_nan() {
        "nan".to_string()
    } else {
        nodata.to_string()
    }
}

// =============================================================================
// Store
// =============================================================================

/// [`RasterStore`] backed by single-band GeoTIFF files.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoTiffStore;

impl GeoTiffStore {
    pub fn new() -> Self {
        Self
    }

    fn read_band(&self, band: &RasterBand) -> Result<Grid, StoreError> {
        if band.band != 1 {
            return Err(StoreError::MissingBand {
                path: band.path.clone(),
                band: band.band,
            });
        }
        read_grid(&band.path)
    }
}

impl RasterStore for GeoTiffStore {
    fn raster_info(&self, path: &Path) -> Result<RasterInfo, StoreError> {
        read_grid(path).map(|grid| grid.info())
    }

    fn warp(
        &self,
        source: &Path,
        pixel_size: PixelSize,
        target: &Path,
        resample: ResampleMethod,
        target_bbox: BoundingBox,
    ) -> Result<(), StoreError> {
        if target_bbox.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "empty target bounding box {}",
                target_bbox
            )));
        }
        let grid = read_grid(source)?;
        let warped = match resample {
            ResampleMethod::Nearest => grid.resample_nearest(&target_bbox, pixel_size)?,
        };
        debug!(
            source = %source.display(),
            target = %target.display(),
            rows = warped.rows(),
            cols = warped.cols(),
            "Warped raster"
        );
        write_grid(target, &warped)
    }

    fn raster_calculator(
        &self,
        inputs: &[RasterBand],
        function: &dyn PixelFunction,
        output: &Path,
        dtype: DataType,
        nodata: f64,
    ) -> Result<(), StoreError> {
        if inputs.len() != function.arity() {
            return Err(StoreError::InvalidArgument(format!(
                "{} expects {} input bands, got {}",
                function.name(),
                function.arity(),
                inputs.len()
            )));
        }

        let grids = inputs
            .iter()
            .map(|band| self.read_band(band))
            .collect::<Result<Vec<_>, _>>()?;
        let first = grids
            .first()
            .ok_or_else(|| StoreError::InvalidArgument("no input bands".into()))?;
        let shape = first.shape();
        if let Some(mismatch) = grids.iter().find(|g| g.shape() != shape) {
            return Err(StoreError::ShapeMismatch {
                expected: shape,
                actual: mismatch.shape(),
            });
        }

        let views: Vec<ArrayView2<'_, f64>> = grids.iter().map(|g| g.data.view()).collect();
        let result = function.evaluate(&views)?;
        if result.dim() != shape {
            return Err(StoreError::ShapeMismatch {
                expected: shape,
                actual: result.dim(),
            });
        }

        debug!(
            function = function.name(),
            output = %output.display(),
            inputs = inputs.len(),
            "Evaluated pixel function"
        );

        let grid = Grid::new(result, first.transform)
            .with_nodata(Some(nodata))
            .with_dtype(dtype);
        write_grid(output, &grid)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::BoundingBoxMode;
    use ndarray::{array, Zip};
    use tempfile::TempDir;

    struct Sum;

    impl PixelFunction for Sum {
        fn name(&self) -> &str {
            "sum"
        }

        fn arity(&self) -> usize {
            2
        }

        fn evaluate(&self, inputs: &[ArrayView2<'_, f64>]) -> Result<Array2<f64>, StoreError> {
            let mut out = Array2::zeros(inputs[0].dim());
            Zip::from(&mut out)
                .and(&inputs[0])
                .and(&inputs[1])
                .for_each(|o, &a, &b| *o = a + b);
            Ok(out)
        }
    }

    fn byte_grid() -> Grid {
        Grid::new(
            array![[0.0, 1.0, 2.0], [3.0, 255.0, 5.0]],
            GeoTransform::new(100.0, 50.0, 10.0, -10.0),
        )
        .with_nodata(Some(255.0))
        .with_dtype(DataType::Byte)
    }

    #[test]
    fn test_write_then_read_preserves_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("mask.tif");
        write_grid(&path, &byte_grid()).unwrap();
        assert!(!partial_path(&path).exists());

        let grid = read_grid(&path).unwrap();
        assert_eq!(grid, byte_grid());

        let info = GeoTiffStore.raster_info(&path).unwrap();
        assert_eq!(info.bounding_box, BoundingBox::new(100.0, 30.0, 130.0, 50.0));
        assert_eq!(info.pixel_size, PixelSize::new(10.0, -10.0));
        assert_eq!(info.dtype, DataType::Byte);
    }

    #[test]
    fn test_float_raster_with_negative_nodata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dist.tif");
        let grid = Grid::new(
            array![[-1.0, 0.5], [2.25, -1.0]],
            GeoTransform::new(0.0, 2.0, 1.0, -1.0),
        )
        .with_nodata(Some(-1.0))
        .with_dtype(DataType::Float32);
        write_grid(&path, &grid).unwrap();

        let read = read_grid(&path).unwrap();
        assert_eq!(read.nodata, Some(-1.0));
        assert_eq!(read.data, grid.data);
    }

    #[test]
    fn test_tags_readable_by_plain_decoder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mask.tif");
        write_grid(&path, &byte_grid()).unwrap();

        let mut decoder = Decoder::new(BufReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(
            decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).unwrap(),
            vec![10.0, 10.0, 0.0]
        );
        assert_eq!(
            decoder
                .get_tag_ascii_string(Tag::GdalNodata)
                .unwrap()
                .trim_matches(char::from(0)),
            "255"
        );
    }

    #[test]
    fn test_float32_nodata_matches_stored_cells() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hazard.tif");
        let grid = Grid::new(array![[-9999.9, 3.0]], GeoTransform::new(0.0, 1.0, 1.0, -1.0))
            .with_nodata(Some(-9999.9))
            .with_dtype(DataType::Float32);
        write_grid(&path, &grid).unwrap();

        let read = read_grid(&path).unwrap();
        let nodata = read.nodata.unwrap();
        assert_eq!(read.data[[0, 0]], nodata);
        assert_eq!(GeoTiffStore.raster_info(&path).unwrap().nodata, Some(nodata));
    }

    #[test]
    fn test_align_and_resize_to_intersection() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.tif");
        let layer = dir.path().join("layer.tif");

        // DEM: 4x4 at 5 units covering [0, 20] x [0, 20]
        let dem_grid = Grid::new(
            Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f64),
            GeoTransform::new(0.0, 20.0, 5.0, -5.0),
        )
        .with_dtype(DataType::Float32);
        write_grid(&dem, &dem_grid).unwrap();
        // Layer: 2x2 at 10 units covering [10, 30] x [0, 20]
        let layer_grid = Grid::new(
            array![[1.0, 2.0], [3.0, 4.0]],
            GeoTransform::new(10.0, 20.0, 10.0, -10.0),
        )
        .with_nodata(Some(255.0))
        .with_dtype(DataType::Byte);
        write_grid(&layer, &layer_grid).unwrap();

        let targets = vec![dir.path().join("a_dem.tif"), dir.path().join("a_layer.tif")];
        let pixel_size = GeoTiffStore.raster_info(&dem).unwrap().pixel_size;
        GeoTiffStore
            .align_and_resize(
                &[dem.clone(), layer.clone()],
                &targets,
                &[ResampleMethod::Nearest, ResampleMethod::Nearest],
                pixel_size,
                BoundingBoxMode::Intersection,
            )
            .unwrap();

        let aligned_dem = read_grid(&targets[0]).unwrap();
        let aligned_layer = read_grid(&targets[1]).unwrap();
        assert_eq!(aligned_dem.shape(), (4, 2));
        assert_eq!(aligned_layer.shape(), (4, 2));
        assert_eq!(aligned_dem.data[[0, 0]], 2.0);
        assert_eq!(aligned_layer.data, array![[1.0, 1.0], [1.0, 1.0], [3.0, 3.0], [3.0, 3.0]]);
        assert_eq!(aligned_layer.nodata, Some(255.0));
        assert_eq!(aligned_layer.dtype, DataType::Byte);
    }

    #[test]
    fn test_raster_calculator_writes_output() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tif");
        let b = dir.path().join("b.tif");
        write_grid(&a, &byte_grid()).unwrap();
        write_grid(&b, &byte_grid().with_nodata(None)).unwrap();

        let out = dir.path().join("sum.tif");
        GeoTiffStore
            .raster_calculator(
                &[RasterBand::first(&a), RasterBand::first(&b)],
                &Sum,
                &out,
                DataType::Int32,
                -1.0,
            )
            .unwrap();

        let grid = read_grid(&out).unwrap();
        assert_eq!(grid.data, array![[0.0, 2.0, 4.0], [6.0, 510.0, 10.0]]);
        assert_eq!(grid.nodata, Some(-1.0));
        assert_eq!(grid.dtype, DataType::Int32);
    }

    #[test]
    fn test_raster_calculator_rejects_bad_inputs() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tif");
        write_grid(&a, &byte_grid()).unwrap();
        let small = dir.path().join("small.tif");
        write_grid(
            &small,
            &Grid::new(array![[1.0]], GeoTransform::new(0.0, 1.0, 1.0, -1.0)),
        )
        .unwrap();
        let out = dir.path().join("out.tif");

        let arity = GeoTiffStore.raster_calculator(
            &[RasterBand::first(&a)],
            &Sum,
            &out,
            DataType::Byte,
            2.0,
        );
        assert!(matches!(arity, Err(StoreError::InvalidArgument(_))));

        let shape = GeoTiffStore.raster_calculator(
            &[RasterBand::first(&a), RasterBand::first(&small)],
            &Sum,
            &out,
            DataType::Byte,
            2.0,
        );
        assert!(matches!(shape, Err(StoreError::ShapeMismatch { .. })));

        let band = GeoTiffStore.raster_calculator(
            &[RasterBand::first(&a), RasterBand::new(&a, 2)],
            &Sum,
            &out,
            DataType::Byte,
            2.0,
        );
        assert!(matches!(band, Err(StoreError::MissingBand { band: 2, .. })));
        assert!(!out.exists());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = GeoTiffStore
            .raster_info(&dir.path().join("absent.tif"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
