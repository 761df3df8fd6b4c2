//! Pipeline configuration.
//!
//! Configuration lives in an INI file, by default `~/.upcover/config.ini`:
//!
//! ```ini
//! [workspace]
//! directory = workspace
//! workers = 4
//! ledger = true
//!
//! [routing]
//! flow_direction = route-tool flow-dir --model {model} {dem} {output} {working_dir}
//! distance_to_channel = route-tool distance --model {model} {flow_dir} {channel_mask} {output}
//!
//! [raster:river_rcp45]
//! path = data/River_Flooding_RCP45_Top_Decile_Vulnerability.tif
//! dem = data/aster_dem.tif
//! model = d8
//! ```
//!
//! Relative paths are resolved against the directory of the config file.
//! A raster `path` may be a glob, producing one entry per match.

use std::path::{Path, PathBuf};

use ini::{Ini, ParseOption};
use thiserror::Error;
use tracing::debug;

use crate::routing::RoutingModel;

/// Directory under the home directory holding the default config.
pub const CONFIG_DIR_NAME: &str = ".upcover";

/// File name of the default config.
pub const CONFIG_FILE_NAME: &str = "config.ini";

/// Prefix of raster section names.
pub const RASTER_SECTION_PREFIX: &str = "raster:";

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(String),

    #[error("missing key '{key}' in section [{section}]")]
    MissingKey { section: String, key: String },

    #[error("invalid value '{value}' for '{key}' in section [{section}]: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid glob pattern '{pattern}': {reason}")]
    Glob { pattern: String, reason: String },

    #[error("pattern '{0}' matched no files")]
    NoMatches(String),

    #[error("no home directory; pass --config explicitly")]
    NoHomeDirectory,
}

/// One raster to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterEntry {
    /// Section name the entry came from.
    pub name: String,
    pub raster: PathBuf,
    pub dem: PathBuf,
    pub model: RoutingModel,
}

impl RasterEntry {
    pub fn new(
        name: impl Into<String>,
        raster: impl Into<PathBuf>,
        dem: impl Into<PathBuf>,
        model: RoutingModel,
    ) -> Self {
        Self {
            name: name.into(),
            raster: raster.into(),
            dem: dem.into(),
            model,
        }
    }
}

/// External routing commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingCommands {
    pub flow_direction: String,
    pub distance_to_channel: String,
}

/// Everything the pipeline driver needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub workspace: PathBuf,
    /// Worker threads; `None` picks one per raster up to the core count.
    pub workers: Option<usize>,
    pub persist_ledger: bool,
    pub routing: Option<RoutingCommands>,
    pub rasters: Vec<RasterEntry>,
}

impl PipelineConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            workers: None,
            persist_ledger: true,
            routing: None,
            rasters: Vec::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_ledger(mut self, persist: bool) -> Self {
        self.persist_ledger = persist;
        self
    }

    pub fn with_routing(mut self, routing: RoutingCommands) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn with_raster(mut self, entry: RasterEntry) -> Self {
        self.rasters.push(entry);
        self
    }

    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(workers) => workers,
            None => {
                let cores = std::thread::available_parallelism()
                    .map(|p| p.get())
                    .unwrap_or(1);
                self.rasters.len().min(cores).max(1)
            }
        }
    }

    /// Default config file location.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
            .ok_or(ConfigError::NoHomeDirectory)
    }

    /// Loads a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base_dir)
    }

    /// Parses INI text, resolving relative paths against `base_dir`.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        // Backslashes are literal so Windows paths survive.
        let options = ParseOption {
            enabled_escape: false,
            ..ParseOption::default()
        };
        let ini = Ini::load_from_str_opt(text, options)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut config = Self::new(base_dir.join("workspace"));

        if let Some(section) = ini.section(Some("workspace")) {
            if let Some(dir) = section.get("directory").map(strip_comment) {
                config.workspace = resolve(base_dir, dir);
            }
            if let Some(value) = section.get("workers").map(strip_comment) {
                let workers = value
                    .parse::<usize>()
                    .map_err(|e| invalid("workspace", "workers", value, e))?;
                config.workers = Some(workers);
            }
            if let Some(value) = section.get("ledger").map(strip_comment) {
                config.persist_ledger = parse_bool(value)
                    .ok_or_else(|| invalid("workspace", "ledger", value, "expected true or false"))?;
            }
        }

        if let Some(section) = ini.section(Some("routing")) {
            let flow_direction = required(section, "routing", "flow_direction")?;
            let distance_to_channel = required(section, "routing", "distance_to_channel")?;
            config.routing = Some(RoutingCommands {
                flow_direction: flow_direction.to_string(),
                distance_to_channel: distance_to_channel.to_string(),
            });
        }

        for (name, section) in ini.iter() {
            let Some(raster_name) = name.and_then(|n| n.strip_prefix(RASTER_SECTION_PREFIX)) else {
                continue;
            };
            let section_name = format!("{}{}", RASTER_SECTION_PREFIX, raster_name);

            let pattern = required(section, &section_name, "path")?;
            let dem = resolve(base_dir, required(section, &section_name, "dem")?);
            let model = match section.get("model").map(strip_comment) {
                Some(value) => value
                    .parse::<RoutingModel>()
                    .map_err(|e| invalid(&section_name, "model", value, e))?,
                None => RoutingModel::default(),
            };

            for raster in expand(base_dir, pattern)? {
                debug!(section = %section_name, raster = %raster.display(), "Configured raster");
                config.rasters.push(RasterEntry {
                    name: raster_name.to_string(),
                    raster,
                    dem: dem.clone(),
                    model,
                });
            }
        }

        Ok(config)
    }
}

fn strip_comment(value: &str) -> &str {
    let end = [" ;", " #", "\t;", "\t#"]
        .iter()
        .filter_map(|marker| value.find(marker))
        .min()
        .unwrap_or(value.len());
    value[..end].trim()
}

fn required<'a>(
    section: &'a ini::Properties,
    section_name: &str,
    key: &str,
) -> Result<&'a str, ConfigError> {
    section
        .get(key)
        .map(strip_comment)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingKey {
            section: section_name.to_string(),
            key: key.to_string(),
        })
}

fn invalid(section: &str, key: &str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn resolve(base_dir: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Expands a raster path pattern into sorted matches.
fn expand(base_dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, ConfigError> {
    let full = resolve(base_dir, pattern);
    if !is_glob(pattern) {
        return Ok(vec![full]);
    }

    let full_pattern = full.to_string_lossy().into_owned();
    let mut matches = glob::glob(&full_pattern)
        .map_err(|e| ConfigError::Glob {
            pattern: full_pattern.clone(),
            reason: e.to_string(),
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Glob {
            pattern: full_pattern.clone(),
            reason: e.to_string(),
        })?;
    if matches.is_empty() {
        return Err(ConfigError::NoMatches(full_pattern));
    }
    matches.sort();
    Ok(matches)
}
