//! Hydrological routing contract.
//!
//! Flow direction and distance-to-channel are computed by an external
//! [`RoutingEngine`]. The crate ships [`CommandRouter`], which runs
//! configured command-line tools.

mod command;

pub use command::{CommandRouter, CommandTemplate, PLACEHOLDERS};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flow routing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingModel {
    /// Single steepest-descent neighbour.
    #[default]
    D8,
    /// Multiple flow direction.
    Mfd,
}

impl RoutingModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::D8 => "d8",
            Self::Mfd => "mfd",
        }
    }
}

impl fmt::Display for RoutingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingModel {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "d8" => Ok(Self::D8),
            "mfd" => Ok(Self::Mfd),
            other => Err(RoutingError::UnknownModel(other.to_string())),
        }
    }
}

/// Errors raised by routing engines.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("unknown routing model '{0}' (expected d8 or mfd)")]
    UnknownModel(String),

    #[error("invalid command template '{template}': {reason}")]
    Template { template: String, reason: String },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("routing engine did not produce {0}")]
    OutputMissing(PathBuf),

    #[error("no routing commands configured")]
    NotConfigured,
}

/// Computes flow direction and distance-to-channel rasters.
pub trait RoutingEngine: Send + Sync {
    /// Writes the flow direction raster for `dem` to `output`.
    ///
    /// `working_dir` may be used for scratch files.
    fn flow_direction(
        &self,
        dem: &Path,
        output: &Path,
        model: RoutingModel,
        working_dir: &Path,
    ) -> Result<(), RoutingError>;

    /// Writes the downstream distance to the nearest channel cell.
    ///
    /// Cells that never reach a channel are set to -1.
    fn distance_to_channel(
        &self,
        flow_dir: &Path,
        channel_mask: &Path,
        output: &Path,
        model: RoutingModel,
    ) -> Result<(), RoutingError>;
}
