//! Helpers shared across CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use upcover::config::PipelineConfig;
use upcover::routing::{CommandRouter, RoutingEngine, RoutingError, RoutingModel};

use crate::error::CliError;

/// Loads the config from `path`, or from the default location.
pub fn load_config(path: Option<PathBuf>) -> Result<PipelineConfig, CliError> {
    let path = match path {
        Some(path) => path,
        None => PipelineConfig::default_path()?,
    };
    if !path.exists() {
        return Err(CliError::Config(format!(
            "Config file not found: {}. Pass --config or create it.",
            path.display()
        )));
    }
    Ok(PipelineConfig::load(&path)?)
}

/// Builds the routing engine described by `[routing]`.
pub fn command_router(config: &PipelineConfig) -> Result<Arc<dyn RoutingEngine>, CliError> {
    let routing = config.routing.as_ref().ok_or_else(|| {
        CliError::Config(
            "No [routing] section in config; flow_direction and distance_to_channel \
             commands are required to run the pipeline"
                .to_string(),
        )
    })?;
    let router = CommandRouter::new(&routing.flow_direction, &routing.distance_to_channel)?;
    Ok(Arc::new(router))
}

/// Routing engine for commands that never execute stages.
pub struct DryRunRouter;

impl RoutingEngine for DryRunRouter {
    fn flow_direction(
        &self,
        _dem: &Path,
        _output: &Path,
        _model: RoutingModel,
        _working_dir: &Path,
    ) -> Result<(), RoutingError> {
        Err(RoutingError::NotConfigured)
    }

    fn distance_to_channel(
        &self,
        _flow_dir: &Path,
        _channel_mask: &Path,
        _output: &Path,
        _model: RoutingModel,
    ) -> Result<(), RoutingError> {
        Err(RoutingError::NotConfigured)
    }
}
