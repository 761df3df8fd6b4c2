//! Routing engine backed by external command-line tools.
//!
//! Each operation is described by a whitespace-separated template whose
//! `{placeholder}` tokens are substituted per call:
//!
//! ```text
//! route-tool flow-dir --model {model} {dem} {output} {working_dir}
//! route-tool distance --model {model} {flow_dir} {channel_mask} {output}
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{RoutingEngine, RoutingError, RoutingModel};

/// Placeholders understood in command templates.
pub const PLACEHOLDERS: &[&str] = &[
    "dem",
    "output",
    "working_dir",
    "model",
    "flow_dir",
    "channel_mask",
];

/// A parsed command line with `{placeholder}` substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    template: String,
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    /// Parses a template, rejecting unknown or unterminated placeholders.
    pub fn parse(template: &str) -> Result<Self, RoutingError> {
        let invalid = |reason: String| RoutingError::Template {
            template: template.to_string(),
            reason,
        };

        let mut tokens = template.split_whitespace().map(str::to_string);
        let program = tokens
            .next()
            .ok_or_else(|| invalid("empty command".to_string()))?;
        let args: Vec<String> = tokens.collect();

        for token in std::iter::once(&program).chain(args.iter()) {
            for name in placeholders_in(token).map_err(invalid)? {
                if !PLACEHOLDERS.contains(&name.as_str()) {
                    return Err(invalid(format!("unknown placeholder {{{}}}", name)));
                }
            }
        }

        Ok(Self {
            template: template.to_string(),
            program,
            args,
        })
    }

    /// Returns the original template text.
    pub fn as_str(&self) -> &str {
        &self.template
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns true if `{name}` appears anywhere in the template.
    pub fn uses(&self, name: &str) -> bool {
        self.template.contains(&format!("{{{}}}", name))
    }

    /// Fails unless every placeholder in `names` is used.
    pub fn require(&self, names: &[&str]) -> Result<(), RoutingError> {
        match names.iter().find(|n| !self.uses(n)) {
            Some(missing) => Err(RoutingError::Template {
                template: self.template.clone(),
                reason: format!("missing required placeholder {{{}}}", missing),
            }),
            None => Ok(()),
        }
    }

    /// Substitutes `values` into the arguments.
    ///
    /// Each argument is scanned once, so substituted text is never expanded
    /// again. Placeholders without a value are kept as written.
    pub fn render(&self, values: &HashMap<&str, String>) -> Vec<String> {
        self.args.iter().map(|arg| render_arg(arg, values)).collect()
    }
}

fn render_arg(arg: &str, values: &HashMap<&str, String>) -> String {
    let mut rendered = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match values.get(name) {
                    Some(value) => rendered.push_str(value),
                    None => {
                        rendered.push('{');
                        rendered.push_str(name);
                        rendered.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                rendered.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

fn placeholders_in(token: &str) -> Result<Vec<String>, String> {
    let mut names = Vec::new();
    let mut rest = token;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{}'", token))?;
        names.push(after[..end].to_string());
        rest = &after[end + 1..];
    }
    Ok(names)
}

/// [`RoutingEngine`] that shells out to configured commands.
#[derive(Debug, Clone)]
pub struct CommandRouter {
    flow_direction: CommandTemplate,
    distance_to_channel: CommandTemplate,
}

impl CommandRouter {
    /// Creates a router from the two command templates.
    pub fn new(flow_direction: &str, distance_to_channel: &str) -> Result<Self, RoutingError> {
        let flow_direction = CommandTemplate::parse(flow_direction)?;
        flow_direction.require(&["dem", "output"])?;
        let distance_to_channel = CommandTemplate::parse(distance_to_channel)?;
        distance_to_channel.require(&["flow_dir", "channel_mask", "output"])?;

        Ok(Self {
            flow_direction,
            distance_to_channel,
        })
    }

    fn run(
        &self,
        operation: &str,
        template: &CommandTemplate,
        values: HashMap<&str, String>,
        output: &Path,
    ) -> Result<(), RoutingError> {
        let args = template.render(&values);
        debug!(operation, program = template.program(), args = ?args, "Running routing command");

        let started = Instant::now();
        let result = Command::new(template.program())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| RoutingError::Spawn {
                program: template.program().to_string(),
                source,
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            warn!(
                operation,
                program = template.program(),
                status = %result.status,
                "Routing command failed"
            );
            return Err(RoutingError::Failed {
                program: template.program().to_string(),
                status: result.status.to_string(),
                stderr,
            });
        }

        if !output.exists() {
            return Err(RoutingError::OutputMissing(output.to_path_buf()));
        }

        info!(
            operation,
            output = %output.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Routing command finished"
        );
        Ok(())
    }
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl RoutingEngine for CommandRouter {
    fn flow_direction(
        &self,
        dem: &Path,
        output: &Path,
        model: RoutingModel,
        working_dir: &Path,
    ) -> Result<(), RoutingError> {
        let values = HashMap::from([
            ("dem", path_value(dem)),
            ("output", path_value(output)),
            ("working_dir", path_value(working_dir)),
            ("model", model.to_string()),
        ]);
        self.run("flow_direction", &self.flow_direction, values, output)
    }

    fn distance_to_channel(
        &self,
        flow_dir: &Path,
        channel_mask: &Path,
        output: &Path,
        model: RoutingModel,
    ) -> Result<(), RoutingError> {
        let values = HashMap::from([
            ("flow_dir", path_value(flow_dir)),
            ("channel_mask", path_value(channel_mask)),
            ("output", path_value(output)),
            ("model", model.to_string()),
        ]);
        self.run(
            "distance_to_channel",
            &self.distance_to_channel,
            values,
            output,
        )
    }
}
