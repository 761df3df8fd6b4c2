//! Info command - print raster metadata.

use std::path::PathBuf;

use upcover::raster::{GeoTiffStore, RasterStore};

use crate::error::CliError;

/// Arguments for the info command.
pub struct InfoArgs {
    pub raster: PathBuf,
}

/// Run the info command.
pub fn run(args: InfoArgs) -> Result<(), CliError> {
    let info = GeoTiffStore::new().raster_info(&args.raster)?;

    println!("Raster: {}", args.raster.display());
    println!("  Size:         {} x {} (cols x rows)", info.cols, info.rows);
    println!("  Data type:    {}", info.dtype);
    println!(
        "  Pixel size:   {} x {}",
        info.pixel_size.x, info.pixel_size.y
    );
    println!("  Bounds:       {}", info.bounding_box);
    match info.nodata {
        Some(nodata) => println!("  Nodata:       {}", nodata),
        None => println!("  Nodata:       (none)"),
    }
    Ok(())
}
