//! User-parameter metrics: keys backed by reloadable shell commands
//!
//! A definition line has the form `key,command`. The flexible form
//! `key[*],command` substitutes `$1`..`$9` in the command with the
//! item's parameters; parameter values are screened for shell special
//! characters unless unsafe user parameters are enabled. Each compiled
//! definition becomes its own exporter plugin flagged as a
//! user-parameter metric, which makes the whole set hot-swappable.

use std::process::Command;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use metricd_core::parse_key;
use metricd_core::plugin::{ExportContext, Exporter, Plugin};

/// Characters rejected inside parameters of flexible user parameters
/// when unsafe user parameters are disabled.
const UNSAFE_CHARS: &str = "\\'\"`*?[]{}~$!&;()<>|#@\n";

/// One compiled user-parameter definition ready for registration.
pub(crate) struct UserParamMetric {
    pub key: String,
    pub description: String,
    pub plugin: Arc<dyn Plugin>,
}

/// Compiles `key,command` definition lines into metrics. Any malformed
/// line fails the whole set; a reload must be all-or-nothing.
pub(crate) fn compile(definitions: &[String], unsafe_params: bool) -> Result<Vec<UserParamMetric>> {
    let mut metrics: Vec<UserParamMetric> = Vec::with_capacity(definitions.len());
    for line in definitions {
        let Some((raw_key, command)) = line.split_once(',') else {
            bail!("cannot add user parameter \"{line}\": not comma-separated");
        };
        let command = command.trim();
        if command.is_empty() {
            bail!("cannot add user parameter \"{line}\": command is missing");
        }
        let raw_key = raw_key.trim();
        let (key, flexible) = match raw_key.strip_suffix("[*]") {
            Some(base) => (base, true),
            None => (raw_key, false),
        };
        let (key, params) = parse_key(key)
            .with_context(|| format!("cannot add user parameter \"{line}\""))?;
        if !params.is_empty() {
            bail!("cannot add user parameter \"{line}\": key must not have parameters");
        }
        if metrics.iter().any(|m| m.key == key) {
            bail!("cannot add user parameter \"{line}\": duplicate key {key}");
        }
        debug!("registered user parameter {key} -> {command}");
        metrics.push(UserParamMetric {
            key: key.clone(),
            description: format!("user parameter: {command}"),
            plugin: Arc::new(UserParameterPlugin {
                name: format!("userparameter {key}"),
                command: command.to_string(),
                flexible,
                unsafe_params,
            }),
        });
    }
    Ok(metrics)
}

/// Exporter running one configured command per request.
struct UserParameterPlugin {
    name: String,
    command: String,
    flexible: bool,
    unsafe_params: bool,
}

impl Plugin for UserParameterPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn exporter(&self) -> Option<&dyn Exporter> {
        Some(self)
    }
}

impl Exporter for UserParameterPlugin {
    fn export(
        &self,
        _key: &str,
        params: &[String],
        _ctx: &ExportContext,
    ) -> Result<Option<String>> {
        let command = self.build_command(params)?;
        let output = run_shell(&command)
            .with_context(|| format!("cannot execute command \"{command}\""))?;
        Ok(Some(output))
    }
}

impl UserParameterPlugin {
    fn build_command(&self, params: &[String]) -> Result<String> {
        if !self.flexible {
            if !params.is_empty() {
                bail!("Parameters are not allowed.");
            }
            return Ok(self.command.clone());
        }
        if params.len() > 9 {
            bail!("Too many parameters.");
        }
        if !self.unsafe_params {
            for param in params {
                if let Some(c) = param.chars().find(|c| UNSAFE_CHARS.contains(*c)) {
                    bail!("Character \"{c}\" is not allowed.");
                }
            }
        }
        let mut command = self.command.clone();
        for (i, param) in params.iter().enumerate() {
            command = command.replace(&format!("${}", i + 1), param);
        }
        Ok(command)
    }
}

fn run_shell(command: &str) -> Result<String> {
    let output = if cfg!(target_os = "windows") {
        Command::new("cmd").arg("/C").arg(command).output()
    } else {
        Command::new("sh").arg("-c").arg(command).output()
    }
    .context("cannot spawn command")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("command failed: {}", stderr.trim());
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.trim_end_matches(['\r', '\n']).to_string())
}
