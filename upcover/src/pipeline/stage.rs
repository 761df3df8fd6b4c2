//! Stage descriptors and their task adapter.
//!
//! A [`Stage`] is a plain, serializable description of one step of the
//! chain. Its JSON form is the task's argument fingerprint, so editing any
//! parameter of a stage invalidates the artifacts it produced.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::mask::MaskOp;
use crate::graph::{Task, TaskError};
use crate::raster::{
    BoundingBox, DataType, PixelSize, RasterBand, RasterStore, ResampleMethod, StoreError,
};
use crate::routing::{RoutingEngine, RoutingError, RoutingModel};

/// Which input an align stage produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignedLayer {
    Dem,
    Raster,
}

/// Stage identity, used in task names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    AlignDem,
    AlignRaster,
    FlowDirection,
    ChannelMask,
    DistanceToChannel,
    CoverageMask,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlignDem => "align_dem",
            Self::AlignRaster => "align_raster",
            Self::FlowDirection => "flow_direction",
            Self::ChannelMask => "channel_mask",
            Self::DistanceToChannel => "distance_to_channel",
            Self::CoverageMask => "coverage_mask",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the per-raster chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    /// Warp a source onto the common grid.
    Align {
        layer: AlignedLayer,
        source: PathBuf,
        target: PathBuf,
        pixel_size: PixelSize,
        bounding_box: BoundingBox,
        resample: ResampleMethod,
    },

    /// Derive flow direction from the aligned DEM.
    FlowDirection {
        dem: PathBuf,
        target: PathBuf,
        model: RoutingModel,
        working_dir: PathBuf,
    },

    /// Threshold the aligned raster into a channel mask.
    ChannelMask {
        source: PathBuf,
        target: PathBuf,
        op: MaskOp,
    },

    /// Distance from every cell to the channel along the flow path.
    DistanceToChannel {
        flow_direction: PathBuf,
        channel_mask: PathBuf,
        target: PathBuf,
        model: RoutingModel,
    },

    /// Join the channel mask with reachability into the final coverage.
    CoverageMask {
        channel_mask: PathBuf,
        distance: PathBuf,
        target: PathBuf,
        op: MaskOp,
    },
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Align {
                layer: AlignedLayer::Dem,
                ..
            } => StageKind::AlignDem,
            Self::Align {
                layer: AlignedLayer::Raster,
                ..
            } => StageKind::AlignRaster,
            Self::FlowDirection { .. } => StageKind::FlowDirection,
            Self::ChannelMask { .. } => StageKind::ChannelMask,
            Self::DistanceToChannel { .. } => StageKind::DistanceToChannel,
            Self::CoverageMask { .. } => StageKind::CoverageMask,
        }
    }

    /// The artifact this stage writes.
    pub fn target(&self) -> &Path {
        match self {
            Self::Align { target, .. }
            | Self::FlowDirection { target, .. }
            | Self::ChannelMask { target, .. }
            | Self::DistanceToChannel { target, .. }
            | Self::CoverageMask { target, .. } => target,
        }
    }

    /// Files this stage reads.
    pub fn inputs(&self) -> Vec<&Path> {
        match self {
            Self::Align { source, .. } => vec![source.as_path()],
            Self::FlowDirection { dem, .. } => vec![dem.as_path()],
            Self::ChannelMask { source, .. } => vec![source.as_path()],
            Self::DistanceToChannel {
                flow_direction,
                channel_mask,
                ..
            } => vec![flow_direction.as_path(), channel_mask.as_path()],
            Self::CoverageMask {
                channel_mask,
                distance,
                ..
            } => vec![channel_mask.as_path(), distance.as_path()],
        }
    }

    /// Runs the stage against the given collaborators.
    pub fn run(
        &self,
        store: &dyn RasterStore,
        router: &dyn RoutingEngine,
    ) -> Result<(), TaskError> {
        let kind = self.kind();
        let store_failed =
            |e: StoreError| TaskError::external(format!("{} failed", kind)).with_source(e);
        let routing_failed =
            |e: RoutingError| TaskError::external(format!("{} failed", kind)).with_source(e);

        match self {
            Self::Align {
                source,
                target,
                pixel_size,
                bounding_box,
                resample,
                ..
            } => store
                .warp(source, *pixel_size, target, *resample, *bounding_box)
                .map_err(store_failed),

            Self::FlowDirection {
                dem,
                target,
                model,
                working_dir,
            } => {
                fs::create_dir_all(working_dir).map_err(|e| {
                    TaskError::new(format!(
                        "cannot create working directory {}",
                        working_dir.display()
                    ))
                    .with_source(e)
                })?;
                router
                    .flow_direction(dem, target, *model, working_dir)
                    .map_err(routing_failed)
            }

            Self::ChannelMask { source, target, op } => store
                .raster_calculator(
                    &[RasterBand::first(source)],
                    op,
                    target,
                    DataType::Byte,
                    op.target_nodata(),
                )
                .map_err(store_failed),

            Self::DistanceToChannel {
                flow_direction,
                channel_mask,
                target,
                model,
            } => router
                .distance_to_channel(flow_direction, channel_mask, target, *model)
                .map_err(routing_failed),

            Self::CoverageMask {
                channel_mask,
                distance,
                target,
                op,
            } => store
                .raster_calculator(
                    &[RasterBand::first(channel_mask), RasterBand::first(distance)],
                    op,
                    target,
                    DataType::Byte,
                    op.target_nodata(),
                )
                .map_err(store_failed),
        }
    }
}

/// Task adapter binding a stage to its collaborators.
pub struct StageTask {
    stage: Stage,
    store: Arc<dyn RasterStore>,
    router: Arc<dyn RoutingEngine>,
}

impl StageTask {
    pub fn new(stage: Stage, store: Arc<dyn RasterStore>, router: Arc<dyn RoutingEngine>) -> Self {
        Self {
            stage,
            store,
            router,
        }
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }
}

impl Task for StageTask {
    fn execute(&self) -> Result<(), TaskError> {
        self.stage.run(self.store.as_ref(), self.router.as_ref())
    }
}
