//! Remote command execution metric
//!
//! `system.run[command]` runs a shell command and returns its output;
//! `system.run[command,nowait]` detaches and answers immediately. The
//! key is disabled unless the plugin's options enable remote commands,
//! and deployments are expected to pair it with a DenyKey rule for
//! non-local clients.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use metricd_core::plugin::{Configurator, ExportContext, Exporter, MetricRegistry, Plugin};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecOptions {
    #[serde(default)]
    enable_remote_commands: bool,
}

pub(crate) struct ExecPlugin {
    enabled: AtomicBool,
}

impl ExecPlugin {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
        }
    }

    pub fn register(registry: &mut MetricRegistry) {
        registry.register(
            Arc::new(ExecPlugin::new()),
            &[("system.run", "Run a command on the host.")],
        );
    }

    fn parse_options(options: Option<&toml::Value>) -> Result<ExecOptions> {
        match options {
            None => Ok(ExecOptions::default()),
            Some(value) => value
                .clone()
                .try_into()
                .context("invalid system.run options"),
        }
    }
}

impl Plugin for ExecPlugin {
    fn name(&self) -> &str {
        "exec"
    }

    fn max_capacity(&self) -> usize {
        10
    }

    fn exporter(&self) -> Option<&dyn Exporter> {
        Some(self)
    }

    fn configurator(&self) -> Option<&dyn Configurator> {
        Some(self)
    }
}

impl Configurator for ExecPlugin {
    fn configure(&self, options: Option<&toml::Value>) {
        let enabled = Self::parse_options(options)
            .map(|o| o.enable_remote_commands)
            .unwrap_or(false);
        self.enabled.store(enabled, Ordering::Relaxed);
        debug!("remote commands enabled: {enabled}");
    }

    fn validate(&self, options: Option<&toml::Value>) -> Result<()> {
        Self::parse_options(options).map(|_| ())
    }
}

impl Exporter for ExecPlugin {
    fn export(
        &self,
        _key: &str,
        params: &[String],
        _ctx: &ExportContext,
    ) -> Result<Option<String>> {
        if !self.enabled.load(Ordering::Relaxed) {
            bail!("Remote commands are not enabled.");
        }
        let Some(command) = params.first().filter(|c| !c.is_empty()) else {
            bail!("Invalid first parameter.");
        };
        let wait = match params.get(1).map(String::as_str) {
            None | Some("wait") | Some("") => true,
            Some("nowait") => false,
            Some(other) => bail!("Invalid second parameter \"{other}\"."),
        };
        if params.len() > 2 {
            bail!("Too many parameters.");
        }

        if !wait {
            shell(command)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("cannot execute command \"{command}\""))?;
            return Ok(Some("1".to_string()));
        }

        let output = shell(command)
            .output()
            .with_context(|| format!("cannot execute command \"{command}\""))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("command failed: {}", stderr.trim());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Some(stdout.trim_end_matches(['\r', '\n']).to_string()))
    }
}

fn shell(command: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use metricd_core::plugin::{Configurator, ExportContext, Plugin};
    use metricd_core::ExpressionSet;

    use super::ExecPlugin;

    fn ctx() -> ExportContext {
        ExportContext {
            client_id: 0,
            itemid: 0,
            expressions: Arc::new(ExpressionSet::default()),
        }
    }

    #[test]
    fn disabled_by_default() {
        let plugin = ExecPlugin::new();
        let err = plugin
            .exporter()
            .unwrap()
            .export("system.run", &["echo hi".to_string()], &ctx())
            .unwrap_err();
        assert!(format!("{err:#}").contains("not enabled"));
    }

    #[test]
    fn validate_rejects_unknown_options() {
        let plugin = ExecPlugin::new();
        let options: toml::Value = toml::from_str("bogus_flag = true").unwrap();
        assert!(plugin.configurator().unwrap().validate(Some(&options)).is_err());

        let options: toml::Value = toml::from_str("enable_remote_commands = true").unwrap();
        assert!(plugin.configurator().unwrap().validate(Some(&options)).is_ok());
    }

    #[test]
    fn configure_flips_the_switch() {
        let plugin = ExecPlugin::new();
        let options: toml::Value = toml::from_str("enable_remote_commands = true").unwrap();
        plugin.configurator().unwrap().configure(Some(&options));
        assert!(plugin.enabled.load(Ordering::Relaxed));
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn runs_commands_when_enabled() {
        let plugin = ExecPlugin::new();
        plugin.enabled.store(true, Ordering::Relaxed);
        let exporter = plugin.exporter().unwrap();
        let value = exporter
            .export("system.run", &["echo hello".to_string()], &ctx())
            .unwrap();
        assert_eq!(value.as_deref(), Some("hello"));

        let value = exporter
            .export(
                "system.run",
                &["sleep 0".to_string(), "nowait".to_string()],
                &ctx(),
            )
            .unwrap();
        assert_eq!(value.as_deref(), Some("1"));
    }
}
