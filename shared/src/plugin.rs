//! Plugin capability traits and the types exchanged with the scheduler
//!
//! A plugin advertises a subset of capabilities by returning `Some` from
//! the corresponding accessor on the [`Plugin`] trait. The scheduler only
//! ever talks to plugins through these accessors: it exports values
//! through [`Exporter`], drives periodic sampling through [`Collector`],
//! starts and stops background machinery through [`Runner`], hands over
//! item batches through [`Watcher`] and applies configuration through
//! [`Configurator`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::expressions::ExpressionSet;

/// A single item request from a consumer.
///
/// `itemid` is assigned by the consumer; synthetic single-item checks use
/// zero. `delay` is the textual update interval (`30`, `90s`, `5m`, ...)
/// and is only meaningful for recurring checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub itemid: u64,
    pub key: String,
    #[serde(default)]
    pub delay: String,
    /// Last processed log size hint for log-style items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_logsize: Option<u64>,
    /// Last known modification time hint for log-style items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
}

/// The outcome of one check delivered to a client sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub itemid: u64,
    /// Collected value; `None` when the plugin had nothing to report yet.
    pub value: Option<String>,
    /// Per-item error message; the task stays scheduled when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
}

impl CheckResult {
    pub fn value(itemid: u64, value: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self {
            itemid,
            value: Some(value.into()),
            error: None,
            ts,
        }
    }

    pub fn error(itemid: u64, message: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self {
            itemid,
            value: None,
            error: Some(message.into()),
            ts,
        }
    }
}

/// Destination for check results, owned by the consumer.
///
/// Writers are consulted for free slots before plugins queue large
/// batches; a full sink drops writes rather than blocking the producer.
pub trait ResultWriter: Send + Sync {
    fn write(&self, result: CheckResult);
    /// Flush buffered results downstream, if the writer buffers at all.
    fn flush(&self) {}
    /// Free slots for regular results.
    fn slots_available(&self) -> usize;
    /// Free slots for results that must survive delivery retries.
    fn persist_slots_available(&self) -> usize {
        self.slots_available()
    }
}

/// Per-call context handed to exporter plugins.
pub struct ExportContext {
    pub client_id: u64,
    pub itemid: u64,
    /// Compiled expression set of the owning client, if any.
    pub expressions: Arc<ExpressionSet>,
}

/// Base trait every plugin implements.
///
/// The capability accessors default to `None`; a plugin overrides the
/// ones it supports. `max_capacity` is the plugin's hard concurrency
/// limit, zero meaning "no opinion" (the scheduler default applies).
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn max_capacity(&self) -> usize {
        0
    }

    fn exporter(&self) -> Option<&dyn Exporter> {
        None
    }

    fn collector(&self) -> Option<&dyn Collector> {
        None
    }

    fn runner(&self) -> Option<&dyn Runner> {
        None
    }

    fn watcher(&self) -> Option<&dyn Watcher> {
        None
    }

    fn configurator(&self) -> Option<&dyn Configurator> {
        None
    }
}

/// Produce a single value for a key and parameter list.
pub trait Exporter: Send + Sync {
    /// Returns `Ok(None)` when no value has been gathered yet.
    fn export(
        &self,
        key: &str,
        params: &[String],
        ctx: &ExportContext,
    ) -> anyhow::Result<Option<String>>;
}

/// Sample and cache on the plugin's own cadence.
pub trait Collector: Send + Sync {
    fn collect(&self) -> anyhow::Result<()>;
    /// Sampling period in seconds, at least 1.
    fn period(&self) -> u64;
}

/// Start/stop hooks for plugins with background machinery.
pub trait Runner: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Receives the full item batch and manages its own polling cadence.
pub trait Watcher: Send + Sync {
    fn watch(&self, requests: &[Request], sink: Arc<dyn ResultWriter>, ctx: &ExportContext);
}

/// Typed configuration hooks invoked during scheduler construction.
pub trait Configurator: Send + Sync {
    fn configure(&self, options: Option<&toml::Value>);
    fn validate(&self, options: Option<&toml::Value>) -> anyhow::Result<()>;
}

/// One registered metric: a key served by a plugin.
#[derive(Clone)]
pub struct Metric {
    pub key: String,
    pub description: String,
    pub plugin: Arc<dyn Plugin>,
    /// Metric defined by reloadable user-parameter configuration.
    pub user_param: bool,
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("key", &self.key)
            .field("plugin", &self.plugin.name())
            .field("user_param", &self.user_param)
            .finish()
    }
}

/// The set of metrics the scheduler is constructed from.
#[derive(Default)]
pub struct MetricRegistry {
    metrics: Vec<Metric>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `keys` as metrics served by `plugin`.
    ///
    /// Registering an already known key replaces the previous owner; the
    /// last registration wins, mirroring configuration override order.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>, keys: &[(&str, &str)]) {
        for (key, description) in keys {
            self.insert(Metric {
                key: (*key).to_string(),
                description: (*description).to_string(),
                plugin: Arc::clone(&plugin),
                user_param: false,
            });
        }
    }

    /// Registers a single reloadable user-parameter metric.
    pub fn register_user_param(
        &mut self,
        plugin: Arc<dyn Plugin>,
        key: impl Into<String>,
        description: impl Into<String>,
    ) {
        self.insert(Metric {
            key: key.into(),
            description: description.into(),
            plugin,
            user_param: true,
        });
    }

    fn insert(&mut self, metric: Metric) {
        if let Some(existing) = self.metrics.iter_mut().find(|m| m.key == metric.key) {
            *existing = metric;
        } else {
            self.metrics.push(metric);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.iter()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
