//! CLI error type.

use thiserror::Error;
use upcover::config::ConfigError;
use upcover::logging::LoggingError;
use upcover::pipeline::PipelineError;
use upcover::raster::StoreError;
use upcover::routing::RoutingError;

/// Errors surfaced to the user by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Raster(#[from] StoreError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("{failed} of {total} rasters failed")]
    RastersFailed { failed: usize, total: usize },
}
