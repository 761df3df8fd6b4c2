//! Run command - execute the pipeline for every configured raster.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use upcover::logging::init_logging;
use upcover::pipeline::{PipelineDriver, RasterOutcome, WorkspaceLayout};
use upcover::raster::GeoTiffStore;

use super::common::{command_router, load_config};
use crate::error::CliError;

/// Arguments for the run command.
pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub workspace: Option<PathBuf>,
    pub workers: Option<usize>,
    pub verbose: bool,
}

/// Run the run command.
pub fn run(args: RunArgs) -> Result<(), CliError> {
    let mut config = load_config(args.config)?;
    if let Some(workspace) = args.workspace {
        config.workspace = workspace;
    }
    if let Some(workers) = args.workers {
        config.workers = Some(workers);
    }
    if config.rasters.is_empty() {
        return Err(CliError::Config(
            "No [raster:<name>] sections in config".to_string(),
        ));
    }

    let layout = WorkspaceLayout::new(&config.workspace);
    let _log_guard = init_logging(&layout.log_dir(), args.verbose)?;
    let router = command_router(&config)?;

    info!(version = upcover::VERSION, "Upcover starting");
    println!("Upcover {}", upcover::VERSION);
    println!("=============");
    println!("Workspace: {}", config.workspace.display());
    println!("Rasters:   {}", config.rasters.len());
    println!("Workers:   {}", config.worker_count());
    println!();

    let total = config.rasters.len();
    let driver = PipelineDriver::new(config, Arc::new(GeoTiffStore), router);
    let summary = driver.run()?;

    for report in &summary.rasters {
        match &report.outcome {
            RasterOutcome::Completed { coverage } => {
                println!("  ok      {} -> {}", report.raster.display(), coverage.display());
            }
            RasterOutcome::Failed { task, error } => {
                println!("  FAILED  {} ({}: {})", report.raster.display(), task, error);
            }
            RasterOutcome::NotPlanned { error } => {
                println!("  SKIPPED {} ({})", report.raster.display(), error);
            }
        }
    }

    let stats = summary.stats;
    println!();
    println!(
        "Tasks: {} executed, {} cached, {} failed, {} skipped after upstream failure ({:.1}s)",
        stats.executed,
        stats.cached,
        stats.failed,
        stats.upstream_failed,
        summary.elapsed.as_secs_f64()
    );

    if !summary.is_success() {
        return Err(CliError::RastersFailed {
            failed: summary.failed_count(),
            total,
        });
    }
    Ok(())
}
