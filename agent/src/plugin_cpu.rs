//! CPU load metrics backed by a periodic collector
//!
//! The collector samples /proc/loadavg on its own cadence and caches
//! the latest reading; `cpu.load[avg1|avg5|avg15]` is then served from
//! the cache without touching procfs on every request. Until the first
//! sample lands the exporter reports no value.

use std::fs;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use metricd_core::plugin::{Collector, ExportContext, Exporter, MetricRegistry, Plugin};

/// Seconds between load average samples.
const SAMPLE_PERIOD: u64 = 10;

#[derive(Clone, Copy)]
struct LoadSample {
    avg1: f64,
    avg5: f64,
    avg15: f64,
    #[allow(dead_code)]
    taken: DateTime<Utc>,
}

pub(crate) struct CpuPlugin {
    latest: Mutex<Option<LoadSample>>,
}

impl CpuPlugin {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(None),
        }
    }

    pub fn register(registry: &mut MetricRegistry) {
        registry.register(
            Arc::new(CpuPlugin::new()),
            &[("cpu.load", "CPU load average.")],
        );
    }
}

impl Plugin for CpuPlugin {
    fn name(&self) -> &str {
        "cpu"
    }

    fn max_capacity(&self) -> usize {
        // served from the cache, no point in wide parallelism
        2
    }

    fn exporter(&self) -> Option<&dyn Exporter> {
        Some(self)
    }

    fn collector(&self) -> Option<&dyn Collector> {
        Some(self)
    }
}

impl Collector for CpuPlugin {
    fn collect(&self) -> Result<()> {
        let content = fs::read_to_string("/proc/loadavg").context("cannot read load average")?;
        let mut fields = content.split_whitespace();
        let mut next = || -> Result<f64> {
            fields
                .next()
                .and_then(|v| v.parse().ok())
                .context("cannot parse load average")
        };
        let sample = LoadSample {
            avg1: next()?,
            avg5: next()?,
            avg15: next()?,
            taken: Utc::now(),
        };
        *self.latest.lock().expect("load sample lock") = Some(sample);
        Ok(())
    }

    fn period(&self) -> u64 {
        SAMPLE_PERIOD
    }
}

impl Exporter for CpuPlugin {
    fn export(
        &self,
        _key: &str,
        params: &[String],
        _ctx: &ExportContext,
    ) -> Result<Option<String>> {
        if params.len() > 1 {
            bail!("Too many parameters.");
        }
        let window = params.first().map(String::as_str).unwrap_or("avg1");
        let Some(sample) = *self.latest.lock().expect("load sample lock") else {
            return Ok(None);
        };
        let value = match window {
            "avg1" => sample.avg1,
            "avg5" => sample.avg5,
            "avg15" => sample.avg15,
            other => bail!("Invalid first parameter \"{other}\"."),
        };
        Ok(Some(format!("{value:.2}")))
    }
}
