//! Upstream coverage pipeline.
//!
//! For every configured raster the driver registers six tasks on a
//! [`TaskGraph`](crate::graph::TaskGraph): both inputs are aligned onto the
//! DEM grid, flow direction is derived from the aligned DEM, the aligned
//! raster is thresholded into a channel mask, distance-to-channel is routed
//! from both, and the final coverage mask joins the channel mask with
//! reachability.
//!
//! # Key Types
//!
//! - [`PipelineDriver`] - plans and runs the chains
//! - [`Stage`] - serializable description of one step
//! - [`MaskOp`] - nodata-aware pixel algebra of the masking steps
//! - [`WorkspaceLayout`] - where every artifact lives

mod driver;
mod layout;
mod mask;
mod stage;

pub use driver::{
    PipelineDriver, PipelineError, RasterOutcome, RasterPipeline, RasterReport, RunSummary,
    StageHandles,
};
pub use layout::{RasterLayout, WorkspaceLayout, COVERAGE_PREFIX, INTERMEDIATE_DIR, LOG_DIR};
pub use mask::{is_nodata, MaskOp, DISTANCE_NODATA, MASK_NODATA};
pub use stage::{AlignedLayer, Stage, StageKind, StageTask};
