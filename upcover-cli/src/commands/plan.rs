//! Plan command - print the stage chain per raster without running it.

use std::path::PathBuf;
use std::sync::Arc;

use upcover::pipeline::PipelineDriver;
use upcover::raster::GeoTiffStore;

use super::common::{load_config, DryRunRouter};
use crate::error::CliError;

/// Arguments for the plan command.
pub struct PlanArgs {
    pub config: Option<PathBuf>,
}

/// Run the plan command.
pub fn run(args: PlanArgs) -> Result<(), CliError> {
    let config = load_config(args.config)?;
    if config.rasters.is_empty() {
        println!("No rasters configured.");
        return Ok(());
    }

    let driver = PipelineDriver::new(config, Arc::new(GeoTiffStore), Arc::new(DryRunRouter));
    println!("Workspace: {}", driver.config().workspace.display());
    println!("Workers:   {}", driver.config().worker_count());
    println!();

    let mut failed = 0;
    for entry in &driver.config().rasters {
        println!(
            "[{}] {} (dem: {}, model: {})",
            entry.name,
            entry.raster.display(),
            entry.dem.display(),
            entry.model
        );
        match driver.stages_for(entry) {
            Ok(stages) => {
                for stage in stages {
                    let inputs: Vec<String> = stage
                        .inputs()
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect();
                    println!("  {:<20} -> {}", stage.kind(), stage.target().display());
                    println!("  {:<20}    from {}", "", inputs.join(", "));
                }
            }
            Err(e) => {
                failed += 1;
                println!("  cannot plan: {}", e);
            }
        }
        println!();
    }

    if failed > 0 {
        return Err(CliError::RastersFailed {
            failed,
            total: driver.config().rasters.len(),
        });
    }
    Ok(())
}
