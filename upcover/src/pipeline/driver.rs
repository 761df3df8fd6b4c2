//! Pipeline driver.
//!
//! Builds the stage chain for every configured raster on a [`TaskGraph`],
//! waits for it and reports a per-raster outcome.
//!
//! ```text
//! align_dem ──► flow_direction ───────┐
//!                                     ▼
//! align_raster ──► channel_mask ──► distance_to_channel
//!                       │                  │
//!                       └──► coverage_mask ◄┘
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::layout::{RasterLayout, WorkspaceLayout};
use super::mask::MaskOp;
use super::stage::{AlignedLayer, Stage, StageTask};
use crate::config::{ConfigError, PipelineConfig, RasterEntry};
use crate::graph::{GraphError, GraphStats, TaskGraph, TaskGraphConfig, TaskHandle, TaskSpec};
use crate::raster::{RasterInfo, RasterStore, ResampleMethod, StoreError};
use crate::routing::RoutingEngine;

/// Errors raised while planning or running the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot read raster metadata for {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("raster {raster} does not overlap DEM {dem}")]
    NoOverlap { raster: PathBuf, dem: PathBuf },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot encode stage arguments: {0}")]
    Args(#[from] serde_json::Error),
}

/// Handles of one raster's registered stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageHandles {
    pub align_dem: TaskHandle,
    pub align_raster: TaskHandle,
    pub flow_direction: TaskHandle,
    pub channel_mask: TaskHandle,
    pub distance_to_channel: TaskHandle,
    pub coverage_mask: TaskHandle,
}

/// One raster's chain as registered on a graph.
#[derive(Debug, Clone)]
pub struct RasterPipeline {
    pub entry: RasterEntry,
    pub layout: RasterLayout,
    pub handles: StageHandles,
}

/// How one raster fared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RasterOutcome {
    /// The coverage raster was produced or is up to date.
    Completed { coverage: PathBuf },
    /// A task in the chain failed.
    Failed { task: String, error: String },
    /// The chain could not be registered.
    NotPlanned { error: String },
}

impl RasterOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Outcome of one configured raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterReport {
    pub raster: PathBuf,
    pub outcome: RasterOutcome,
}

/// Result of [`PipelineDriver::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub rasters: Vec<RasterReport>,
    pub stats: GraphStats,
    pub elapsed: Duration,
}

impl RunSummary {
    /// True when every raster produced its coverage.
    pub fn is_success(&self) -> bool {
        self.rasters.iter().all(|r| r.outcome.is_success())
    }

    pub fn failed_count(&self) -> usize {
        self.rasters
            .iter()
            .filter(|r| !r.outcome.is_success())
            .count()
    }
}

/// The six stages of one raster, in registration order.
struct StageChain {
    align_dem: Stage,
    align_raster: Stage,
    flow_direction: Stage,
    channel_mask: Stage,
    distance_to_channel: Stage,
    coverage_mask: Stage,
}

impl StageChain {
    fn stages(&self) -> [&Stage; 6] {
        [
            &self.align_dem,
            &self.align_raster,
            &self.flow_direction,
            &self.channel_mask,
            &self.distance_to_channel,
            &self.coverage_mask,
        ]
    }

    fn into_vec(self) -> Vec<Stage> {
        vec![
            self.align_dem,
            self.align_raster,
            self.flow_direction,
            self.channel_mask,
            self.distance_to_channel,
            self.coverage_mask,
        ]
    }
}

/// Plans and runs the upstream coverage pipeline.
pub struct PipelineDriver {
    config: PipelineConfig,
    layout: WorkspaceLayout,
    store: Arc<dyn RasterStore>,
    router: Arc<dyn RoutingEngine>,
    /// Metadata per source path, read once.
    info_cache: Mutex<HashMap<PathBuf, RasterInfo>>,
}

impl PipelineDriver {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RasterStore>,
        router: Arc<dyn RoutingEngine>,
    ) -> Self {
        let layout = WorkspaceLayout::new(&config.workspace);
        Self {
            config,
            layout,
            store,
            router,
            info_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    fn raster_info(&self, path: &Path) -> Result<RasterInfo, PipelineError> {
        if let Some(info) = self.info_cache.lock().get(path) {
            return Ok(info.clone());
        }
        let info = self
            .store
            .raster_info(path)
            .map_err(|source| PipelineError::Store {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), rows = info.rows, cols = info.cols, "Read raster info");
        self.info_cache
            .lock()
            .insert(path.to_path_buf(), info.clone());
        Ok(info)
    }

    fn build_chain(&self, entry: &RasterEntry) -> Result<(RasterLayout, StageChain), PipelineError> {
        let dem_info = self.raster_info(&entry.dem)?;
        let raster_info = self.raster_info(&entry.raster)?;
        let bounding_box = dem_info
            .bounding_box
            .intersection(&raster_info.bounding_box)
            .ok_or_else(|| PipelineError::NoOverlap {
                raster: entry.raster.clone(),
                dem: entry.dem.clone(),
            })?;

        let layout = self.layout.for_raster(&entry.raster, &entry.dem);
        let align = |layer, source: &Path, target: &Path| Stage::Align {
            layer,
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            pixel_size: dem_info.pixel_size,
            bounding_box,
            resample: ResampleMethod::Nearest,
        };

        let chain = StageChain {
            align_dem: align(AlignedLayer::Dem, &entry.dem, &layout.aligned_dem),
            align_raster: align(AlignedLayer::Raster, &entry.raster, &layout.aligned_raster),
            flow_direction: Stage::FlowDirection {
                dem: layout.aligned_dem.clone(),
                target: layout.flow_dir.clone(),
                model: entry.model,
                working_dir: layout.working_dir.clone(),
            },
            channel_mask: Stage::ChannelMask {
                source: layout.aligned_raster.clone(),
                target: layout.channel_mask.clone(),
                op: MaskOp::channel(raster_info.nodata),
            },
            distance_to_channel: Stage::DistanceToChannel {
                flow_direction: layout.flow_dir.clone(),
                channel_mask: layout.channel_mask.clone(),
                target: layout.distance.clone(),
                model: entry.model,
            },
            coverage_mask: Stage::CoverageMask {
                channel_mask: layout.channel_mask.clone(),
                distance: layout.distance.clone(),
                target: layout.coverage.clone(),
                op: MaskOp::coverage(),
            },
        };
        Ok((layout, chain))
    }

    /// Stage descriptors for one raster, without registering them.
    pub fn stages_for(&self, entry: &RasterEntry) -> Result<Vec<Stage>, PipelineError> {
        self.build_chain(entry).map(|(_, chain)| chain.into_vec())
    }

    fn register(
        &self,
        graph: &TaskGraph,
        stem: &str,
        stage: Stage,
        dependencies: &[TaskHandle],
        external_input: bool,
    ) -> Result<TaskHandle, PipelineError> {
        let name = format!("{}:{}", stage.kind(), stem);
        let args = serde_json::to_value(&stage)?;
        let target = stage.target().to_path_buf();
        let inputs: Vec<PathBuf> = if external_input {
            stage.inputs().into_iter().map(Path::to_path_buf).collect()
        } else {
            Vec::new()
        };

        let mut spec = TaskSpec::new(
            name,
            StageTask::new(stage, Arc::clone(&self.store), Arc::clone(&self.router)),
        )
        .args(args)
        .target(target);
        for dep in dependencies {
            spec = spec.depends_on(dep);
        }
        for input in inputs {
            spec = spec.input(input);
        }
        Ok(graph.add_task(spec)?)
    }

    /// Registers the chain for one raster.
    pub fn plan_entry(
        &self,
        graph: &TaskGraph,
        entry: &RasterEntry,
    ) -> Result<RasterPipeline, PipelineError> {
        let (layout, chain) = self.build_chain(entry)?;
        let stem = layout.stem.as_str();

        // A clash on any target must leave no part of the chain registered.
        for stage in chain.stages() {
            if let Some(owner) = graph.target_owner(stage.target()) {
                return Err(GraphError::DuplicateTarget {
                    path: stage.target().to_path_buf(),
                    task: format!("{}:{}", stage.kind(), stem),
                    owner,
                }
                .into());
            }
        }

        let align_dem = self.register(graph, stem, chain.align_dem, &[], true)?;
        let align_raster = self.register(graph, stem, chain.align_raster, &[], true)?;
        let flow_direction =
            self.register(graph, stem, chain.flow_direction, &[align_dem], false)?;
        let channel_mask = self.register(graph, stem, chain.channel_mask, &[align_raster], false)?;
        let distance_to_channel = self.register(
            graph,
            stem,
            chain.distance_to_channel,
            &[flow_direction, channel_mask],
            false,
        )?;
        let coverage_mask = self.register(
            graph,
            stem,
            chain.coverage_mask,
            &[channel_mask, distance_to_channel],
            false,
        )?;

        info!(raster = %entry.raster.display(), stem, "Planned raster pipeline");

        Ok(RasterPipeline {
            entry: entry.clone(),
            layout,
            handles: StageHandles {
                align_dem,
                align_raster,
                flow_direction,
                channel_mask,
                distance_to_channel,
                coverage_mask,
            },
        })
    }

    /// Registers the chain for every configured raster.
    pub fn plan(&self, graph: &TaskGraph) -> Result<Vec<RasterPipeline>, PipelineError> {
        self.config
            .rasters
            .iter()
            .map(|entry| self.plan_entry(graph, entry))
            .collect()
    }

    /// Runs the whole pipeline on a fresh graph.
    ///
    /// A raster that cannot be planned or whose chain fails is reported in
    /// the summary; the others still run. Only graph setup and ledger
    /// persistence errors are returned as `Err`.
    pub fn run(&self) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let graph = TaskGraph::new(
            TaskGraphConfig::new(&self.config.workspace)
                .with_workers(self.config.worker_count())
                .with_ledger(self.config.persist_ledger),
        )?;

        let planned: Vec<(PathBuf, Result<RasterPipeline, PipelineError>)> = self
            .config
            .rasters
            .iter()
            .map(|entry| (entry.raster.clone(), self.plan_entry(&graph, entry)))
            .collect();

        if let Err(e) = graph.join() {
            warn!(error = %e, "Pipeline finished with failures");
        }

        let mut rasters = Vec::with_capacity(planned.len());
        for (raster, plan) in planned {
            let outcome = match plan {
                Err(e) => {
                    error!(raster = %raster.display(), error = %e, "Raster could not be planned");
                    RasterOutcome::NotPlanned {
                        error: e.to_string(),
                    }
                }
                Ok(pipeline) => match graph.join_task(&pipeline.handles.coverage_mask) {
                    Ok(()) => {
                        info!(
                            raster = %raster.display(),
                            coverage = %pipeline.layout.coverage.display(),
                            "Coverage ready"
                        );
                        RasterOutcome::Completed {
                            coverage: pipeline.layout.coverage,
                        }
                    }
                    Err(GraphError::TaskFailed { task, error }) => {
                        error!(raster = %raster.display(), task = %task, "Raster pipeline failed");
                        RasterOutcome::Failed {
                            task,
                            error: error.to_string(),
                        }
                    }
                    Err(other) => return Err(other.into()),
                },
            };
            rasters.push(RasterReport { raster, outcome });
        }

        let stats = graph.stats();
        match graph.close() {
            Ok(()) | Err(GraphError::TaskFailed { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let summary = RunSummary {
            rasters,
            stats,
            elapsed: started.elapsed(),
        };
        info!(
            rasters = summary.rasters.len(),
            failed = summary.failed_count(),
            executed = stats.executed,
            cached = stats.cached,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Pipeline run complete"
        );
        Ok(summary)
    }
}
