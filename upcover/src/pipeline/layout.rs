//! Workspace file layout.
//!
//! ```text
//! <workspace>/
//! ├── upstream_coverage_<raster basename>      final coverage per raster
//! ├── taskgraph_ledger.json
//! ├── logs/upcover.log
//! └── intermediate/<raster stem>/
//!     ├── aligned_dem_<dem basename>
//!     ├── aligned_<raster basename>
//!     ├── flow_dir.tif
//!     ├── channel_proxy.tif
//!     └── dist_to_channel.tif
//! ```

use std::path::{Path, PathBuf};

/// Directory holding per-raster intermediates.
pub const INTERMEDIATE_DIR: &str = "intermediate";

/// Directory holding log files.
pub const LOG_DIR: &str = "logs";

/// Prefix of the final coverage rasters.
pub const COVERAGE_PREFIX: &str = "upstream_coverage_";

/// Paths under a pipeline workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    /// All artifact paths for one raster/DEM pair.
    pub fn for_raster(&self, raster: &Path, dem: &Path) -> RasterLayout {
        let stem = file_stem(raster);
        let raster_name = file_name(raster);
        let working_dir = self.root.join(INTERMEDIATE_DIR).join(&stem);

        RasterLayout {
            aligned_dem: working_dir.join(format!("aligned_dem_{}", file_name(dem))),
            aligned_raster: working_dir.join(format!("aligned_{}", raster_name)),
            flow_dir: working_dir.join("flow_dir.tif"),
            channel_mask: working_dir.join("channel_proxy.tif"),
            distance: working_dir.join("dist_to_channel.tif"),
            coverage: self.root.join(format!("{}{}", COVERAGE_PREFIX, raster_name)),
            working_dir,
            stem,
        }
    }
}

/// Artifact paths for one configured raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterLayout {
    /// File stem of the source raster; used in task names.
    pub stem: String,
    pub working_dir: PathBuf,
    pub aligned_dem: PathBuf,
    pub aligned_raster: PathBuf,
    pub flow_dir: PathBuf,
    pub channel_mask: PathBuf,
    pub distance: PathBuf,
    pub coverage: PathBuf,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "raster".to_string())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "raster".to_string())
}
