//! Schedulable task variants and their timing rules
//!
//! Every task owns its next-run instant, an active flag and a
//! back-reference to the plugin it runs against. The scheduled instant
//! is kept at whole-second resolution with the nanosecond field
//! encoding the variant priority, so tasks sharing a second dispatch in
//! a stable order (starter before collector before watcher before
//! exporter before stopper).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use metricd_core::plugin::{ExportContext, Plugin, Request, ResultWriter};
use metricd_core::{CheckResult, ExpressionSet, SchedulerError};

use crate::plugin_agent::PluginId;

/// Largest accepted update interval, one day.
pub(crate) const MAX_DELAY_SECONDS: u64 = 86_400;

const PRIORITY_STARTER: u32 = 0;
const PRIORITY_COLLECTOR: u32 = 1;
const PRIORITY_WATCHER: u32 = 2;
const PRIORITY_EXPORTER: u32 = 3;
const PRIORITY_STOPPER: u32 = 4;

/// Item state snapshot carried by exporter-style tasks.
///
/// The authoritative copy lives in the owning client's exporter map;
/// the scheduler refreshes this snapshot from it when the task returns
/// from a worker, so an in-flight task is never mutated.
#[derive(Debug, Clone)]
pub(crate) struct ItemSnapshot {
    /// Bare key, brackets stripped.
    pub key: String,
    pub params: Vec<String>,
    /// Update interval in seconds; unused for one-shot checks.
    pub delay: u64,
}

pub(crate) struct ExporterPayload {
    pub client: u64,
    pub itemid: u64,
    pub item: ItemSnapshot,
    pub sink: Arc<dyn ResultWriter>,
    pub expressions: Arc<ExpressionSet>,
}

pub(crate) struct WatcherPayload {
    pub client: u64,
    pub requests: Vec<Request>,
    pub sink: Arc<dyn ResultWriter>,
    pub expressions: Arc<ExpressionSet>,
}

pub(crate) enum TaskKind {
    /// Recurring value production for one client item.
    Exporter(ExporterPayload),
    /// One-shot on-demand variant of the exporter task.
    DirectExporter(ExporterPayload),
    /// Drives a plugin's periodic internal sampling.
    Collector { period: u64, seed: u64 },
    /// Pushes the full item batch into a self-polling plugin.
    Watcher(WatcherPayload),
    /// One-shot Start hook invocation.
    Starter,
    /// One-shot Stop hook invocation.
    Stopper,
}

pub(crate) struct Task {
    plugin: PluginId,
    scheduled: DateTime<Utc>,
    active: bool,
    index: Option<usize>,
    kind: TaskKind,
}

impl Task {
    fn new(plugin: PluginId, kind: TaskKind) -> Box<Self> {
        Box::new(Self {
            plugin,
            scheduled: DateTime::<Utc>::MIN_UTC,
            active: true,
            index: None,
            kind,
        })
    }

    /// Creates a recurring exporter task. With `immediate` the first
    /// fire lands on the current second instead of the delay grid.
    pub fn new_exporter(
        plugin: PluginId,
        payload: ExporterPayload,
        now: DateTime<Utc>,
        immediate: bool,
    ) -> Result<Box<Self>, SchedulerError> {
        let mut task = Self::new(plugin, TaskKind::Exporter(payload));
        if immediate {
            task.scheduled = at_second(now, PRIORITY_EXPORTER)?;
        } else {
            task.reschedule(now)?;
        }
        Ok(task)
    }

    pub fn new_direct_exporter(
        plugin: PluginId,
        payload: ExporterPayload,
        now: DateTime<Utc>,
    ) -> Result<Box<Self>, SchedulerError> {
        let mut task = Self::new(plugin, TaskKind::DirectExporter(payload));
        task.reschedule(now)?;
        Ok(task)
    }

    pub fn new_collector(
        plugin: PluginId,
        period: u64,
        seed: u64,
        now: DateTime<Utc>,
    ) -> Result<Box<Self>, SchedulerError> {
        let mut task = Self::new(plugin, TaskKind::Collector { period, seed });
        task.reschedule(now)?;
        Ok(task)
    }

    pub fn new_watcher(
        plugin: PluginId,
        payload: WatcherPayload,
        now: DateTime<Utc>,
    ) -> Result<Box<Self>, SchedulerError> {
        let mut task = Self::new(plugin, TaskKind::Watcher(payload));
        task.reschedule(now)?;
        Ok(task)
    }

    pub fn new_starter(plugin: PluginId, now: DateTime<Utc>) -> Result<Box<Self>, SchedulerError> {
        let mut task = Self::new(plugin, TaskKind::Starter);
        task.reschedule(now)?;
        Ok(task)
    }

    pub fn new_stopper(plugin: PluginId, now: DateTime<Utc>) -> Result<Box<Self>, SchedulerError> {
        let mut task = Self::new(plugin, TaskKind::Stopper);
        task.reschedule(now)?;
        Ok(task)
    }

    pub fn plugin(&self) -> PluginId {
        self.plugin
    }

    /// Rebinds the task to a fresh plugin agent (user-parameter reload).
    pub fn set_plugin(&mut self, plugin: PluginId) {
        self.plugin = plugin;
    }

    pub fn scheduled(&self) -> DateTime<Utc> {
        self.scheduled
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn set_index(&mut self, index: Option<usize>) {
        self.index = index;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// A deactivated task is discarded on its next dequeue instead of
    /// being performed or rescheduled.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_recurring(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::Exporter(_) | TaskKind::Collector { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TaskKind::Exporter(_) => "exporter",
            TaskKind::DirectExporter(_) => "direct exporter",
            TaskKind::Collector { .. } => "collector",
            TaskKind::Watcher(_) => "watcher",
            TaskKind::Starter => "starter",
            TaskKind::Stopper => "stopper",
        }
    }

    /// Exporter payload access for snapshot refresh on finish.
    pub fn exporter_mut(&mut self) -> Option<&mut ExporterPayload> {
        match &mut self.kind {
            TaskKind::Exporter(payload) => Some(payload),
            _ => None,
        }
    }

    /// True for the recurring exporter task of `(client, itemid)`.
    pub fn is_exporter_for(&self, client: u64, itemid: u64) -> bool {
        matches!(&self.kind, TaskKind::Exporter(p) if p.client == client && p.itemid == itemid)
    }

    pub fn item_key(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::Exporter(p) | TaskKind::DirectExporter(p) => Some(&p.item.key),
            _ => None,
        }
    }

    /// Computes the next run instant. Failure deactivates the task; the
    /// caller drops it.
    pub fn reschedule(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let result = match &self.kind {
            TaskKind::Exporter(payload) => {
                let seed = exporter_seed(payload);
                next_check(seed, payload.item.delay, now)
                    .and_then(|t| at_second(t, PRIORITY_EXPORTER))
            }
            TaskKind::DirectExporter(_) => at_second(now, PRIORITY_EXPORTER),
            TaskKind::Collector { period, seed } => {
                next_check(*seed, *period, now).and_then(|t| at_second(t, PRIORITY_COLLECTOR))
            }
            TaskKind::Watcher(_) => at_second(now, PRIORITY_WATCHER),
            TaskKind::Starter => at_second(now, PRIORITY_STARTER),
            TaskKind::Stopper => at_second(now, PRIORITY_STOPPER),
        };
        match result {
            Ok(scheduled) => {
                self.scheduled = scheduled;
                Ok(())
            }
            Err(err) => {
                self.active = false;
                Err(err)
            }
        }
    }

    /// Executes the task body against the plugin implementation. Runs on
    /// a worker, touches only per-task data and the client sink.
    pub fn perform(&mut self, plugin: &dyn Plugin) {
        let now = Utc::now();
        match &self.kind {
            TaskKind::Exporter(payload) => perform_export(plugin, payload, now, false),
            TaskKind::DirectExporter(payload) => perform_export(plugin, payload, now, true),
            TaskKind::Collector { .. } => {
                if let Some(collector) = plugin.collector() {
                    if let Err(err) = collector.collect() {
                        warn!("plugin {} collector failed: {err:#}", plugin.name());
                    }
                }
            }
            TaskKind::Watcher(payload) => {
                if let Some(watcher) = plugin.watcher() {
                    let ctx = ExportContext {
                        client_id: payload.client,
                        itemid: 0,
                        expressions: Arc::clone(&payload.expressions),
                    };
                    watcher.watch(&payload.requests, Arc::clone(&payload.sink), &ctx);
                }
            }
            TaskKind::Starter => {
                if let Some(runner) = plugin.runner() {
                    runner.start();
                }
            }
            TaskKind::Stopper => {
                if let Some(runner) = plugin.runner() {
                    runner.stop();
                }
            }
        }
    }

    /// Reports a failure result for tasks that owe the consumer an
    /// answer. Used by the worker panic guard.
    pub fn fail(&self, message: &str) {
        match &self.kind {
            TaskKind::Exporter(payload) | TaskKind::DirectExporter(payload) => {
                payload
                    .sink
                    .write(CheckResult::error(payload.itemid, message, Utc::now()));
            }
            _ => {}
        }
    }
}

fn perform_export(plugin: &dyn Plugin, payload: &ExporterPayload, now: DateTime<Utc>, direct: bool) {
    let Some(exporter) = plugin.exporter() else {
        payload.sink.write(CheckResult::error(
            payload.itemid,
            format!("Plugin {} does not support item polling.", plugin.name()),
            now,
        ));
        return;
    };
    let ctx = ExportContext {
        client_id: payload.client,
        itemid: payload.itemid,
        expressions: Arc::clone(&payload.expressions),
    };
    match exporter.export(&payload.item.key, &payload.item.params, &ctx) {
        Ok(Some(value)) => payload
            .sink
            .write(CheckResult::value(payload.itemid, value, now)),
        // single on-demand checks always answer, even with no value yet
        Ok(None) if direct => payload.sink.write(CheckResult {
            itemid: payload.itemid,
            value: None,
            error: None,
            ts: now,
        }),
        Ok(None) => {}
        Err(err) => payload
            .sink
            .write(CheckResult::error(payload.itemid, format!("{err:#}"), now)),
    }
}

fn exporter_seed(payload: &ExporterPayload) -> u64 {
    if payload.itemid != 0 {
        payload.itemid
    } else {
        key_seed(&payload.item.key)
    }
}

/// Stable hash used to spread items without an id over the delay grid.
pub(crate) fn key_seed(key: &str) -> u64 {
    use std::hash::{DefaultHasher, Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Truncates an instant to its second and encodes the variant priority
/// into the nanosecond field.
fn at_second(instant: DateTime<Utc>, priority: u32) -> Result<DateTime<Utc>, SchedulerError> {
    DateTime::from_timestamp(instant.timestamp(), priority)
        .ok_or_else(|| SchedulerError::Schedule("instant out of range".into()))
}

/// Smallest grid point strictly after `now` for an item with the given
/// delay, phase-shifted by `seed` so items with equal delays spread out.
pub(crate) fn next_check(
    seed: u64,
    delay: u64,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    if delay == 0 || delay > MAX_DELAY_SECONDS {
        return Err(SchedulerError::Schedule(format!(
            "update interval of {delay} seconds is out of range"
        )));
    }
    let delay = delay as i64;
    let now_ts = now.timestamp();
    let shift = (seed % delay as u64) as i64;
    let mut next = now_ts - now_ts.rem_euclid(delay) + shift;
    while next <= now_ts {
        next += delay;
    }
    DateTime::from_timestamp(next, 0)
        .ok_or_else(|| SchedulerError::Schedule("next check out of range".into()))
}

/// Parses a textual update interval: plain seconds or a number with an
/// `s`, `m`, `h` or `d` suffix. The result must land in 1..=86400.
pub(crate) fn parse_delay(text: &str) -> Result<u64, SchedulerError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SchedulerError::Schedule("empty update interval".into()));
    }
    let (number, multiplier) = match text.as_bytes()[text.len() - 1] {
        b's' => (&text[..text.len() - 1], 1),
        b'm' => (&text[..text.len() - 1], 60),
        b'h' => (&text[..text.len() - 1], 3_600),
        b'd' => (&text[..text.len() - 1], 86_400),
        _ => (text, 1),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| SchedulerError::Schedule(format!("invalid update interval \"{text}\"")))?;
    let seconds = value * multiplier;
    if seconds == 0 || seconds > MAX_DELAY_SECONDS {
        return Err(SchedulerError::Schedule(format!(
            "update interval \"{text}\" is out of range"
        )));
    }
    Ok(seconds)
}
