//! Basic system information metrics
//!
//! Plain exporter plugin serving `system.uptime`, `system.uname` and
//! `system.hostname` from procfs, with portable fallbacks where the
//! information exists elsewhere.

use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use metricd_core::plugin::{ExportContext, Exporter, MetricRegistry, Plugin};

pub(crate) struct SystemPlugin;

impl SystemPlugin {
    pub fn register(registry: &mut MetricRegistry) {
        registry.register(
            Arc::new(SystemPlugin),
            &[
                ("system.uptime", "System uptime in seconds."),
                ("system.uname", "Operating system identification."),
                ("system.hostname", "System host name."),
            ],
        );
    }
}

impl Plugin for SystemPlugin {
    fn name(&self) -> &str {
        "system"
    }

    fn exporter(&self) -> Option<&dyn Exporter> {
        Some(self)
    }
}

impl Exporter for SystemPlugin {
    fn export(
        &self,
        key: &str,
        params: &[String],
        _ctx: &ExportContext,
    ) -> Result<Option<String>> {
        if !params.is_empty() {
            bail!("Too many parameters.");
        }
        let value = match key {
            "system.uptime" => uptime_seconds()?,
            "system.uname" => uname()?,
            "system.hostname" => hostname()?,
            other => bail!("Unsupported metric {other}."),
        };
        Ok(Some(value))
    }
}

fn uptime_seconds() -> Result<String> {
    let content = fs::read_to_string("/proc/uptime").context("cannot read system uptime")?;
    let seconds = content
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .context("cannot parse system uptime")?;
    Ok(format!("{}", seconds as u64))
}

fn uname() -> Result<String> {
    let ostype = fs::read_to_string("/proc/sys/kernel/ostype");
    let release = fs::read_to_string("/proc/sys/kernel/osrelease");
    match (ostype, release) {
        (Ok(ostype), Ok(release)) => Ok(format!("{} {}", ostype.trim(), release.trim())),
        _ => Ok(format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)),
    }
}

fn hostname() -> Result<String> {
    let content =
        fs::read_to_string("/proc/sys/kernel/hostname").context("cannot read host name")?;
    Ok(content.trim().to_string())
}
