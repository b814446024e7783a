//! Per-consumer subscription state
//!
//! A client owns the set of item subscriptions one consumer asked for,
//! the sink its results are written to and the compiled expression set
//! it shipped with the last refresh. Clients increment a plugin's
//! reference count on first use and release it through `cleanup` once no
//! subscription needs the plugin anymore.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use metricd_core::plugin::{Request, ResultWriter};
use metricd_core::{ExpressionSet, SchedulerError};

use crate::plugin_agent::{PluginId, PluginStore};
use crate::task::{parse_delay, ExporterPayload, ItemSnapshot, Task};

/// Reserved client of the passive (polled) checks.
pub(crate) const PASSIVE_CHECKS_CLIENT_ID: u64 = 0;
/// Reserved client of single on-demand test checks.
pub(crate) const TESTRUN_CLIENT_ID: u64 = 1;
/// Reserved client of locally configured checks; bypasses key access
/// rules.
pub(crate) const LOCAL_CHECKS_CLIENT_ID: u64 = 2;
/// Highest reserved id; everything above is a real upstream consumer.
pub(crate) const MAX_BUILTIN_CLIENT_ID: u64 = 2;

/// How long a built-in client keeps a plugin referenced after its last
/// one-shot check before the hourly cleanup releases it.
const DIRECT_CHECK_LIFETIME_SECS: i64 = 3_600;

/// Last-seen bookkeeping for one plugin used by this client.
struct PluginUsage {
    used: DateTime<Utc>,
}

/// Authoritative state of one recurring exporter subscription. The task
/// in the plugin's heap carries a snapshot of this; the scheduler
/// re-synchronizes the snapshot whenever the task returns from a worker.
pub(crate) struct ExporterSub {
    pub plugin: PluginId,
    /// Raw key as the consumer sent it, for change detection.
    pub raw_key: String,
    pub item: ItemSnapshot,
    /// Instant of the last refresh that mentioned this item.
    pub updated: DateTime<Utc>,
}

pub(crate) struct Client {
    id: u64,
    sink: Arc<dyn ResultWriter>,
    expressions: Arc<ExpressionSet>,
    plugins_info: HashMap<PluginId, PluginUsage>,
    exporters: HashMap<u64, ExporterSub>,
}

impl Client {
    pub fn new(id: u64, sink: Arc<dyn ResultWriter>) -> Self {
        Self {
            id,
            sink,
            expressions: Arc::new(ExpressionSet::default()),
            plugins_info: HashMap::new(),
            exporters: HashMap::new(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.id <= MAX_BUILTIN_CLIENT_ID
    }

    pub fn sink(&self) -> Arc<dyn ResultWriter> {
        Arc::clone(&self.sink)
    }

    pub fn expressions(&self) -> Arc<ExpressionSet> {
        Arc::clone(&self.expressions)
    }

    pub fn update_expressions(&mut self, expressions: Arc<ExpressionSet>) {
        self.expressions = expressions;
    }

    /// A reconnecting consumer may bring a fresh sink; tasks created
    /// from here on write to it, in-flight ones finish into the old one.
    pub fn update_sink(&mut self, sink: Arc<dyn ResultWriter>) {
        self.sink = sink;
    }

    #[allow(dead_code)]
    pub fn subscription_count(&self) -> usize {
        self.plugins_info.len()
    }

    pub fn has_subscriptions(&self) -> bool {
        !self.plugins_info.is_empty()
    }

    pub fn exporter_sub(&self, itemid: u64) -> Option<&ExporterSub> {
        self.exporters.get(&itemid)
    }

    /// Marks the exporter task of `itemid` as dead: the record is
    /// removed and a queued task is taken out of its plugin heap. An
    /// in-flight task is dropped on finish once the record is gone.
    pub fn deactivate_exporter(&mut self, store: &mut PluginStore, itemid: u64) {
        if let Some(sub) = self.exporters.remove(&itemid) {
            store
                .get_mut(sub.plugin)
                .remove_exporter_task(self.id, itemid);
        }
    }

    /// Repoints the exporter record of `itemid` at a fresh plugin agent
    /// (user-parameter reload).
    pub fn rebind_exporter(&mut self, itemid: u64, plugin: PluginId) {
        if let Some(sub) = self.exporters.get_mut(&itemid) {
            sub.plugin = plugin;
        }
    }

    /// Reconciles one incoming request against the current
    /// subscriptions: reuses a matching exporter subscription without
    /// touching the reference count, creates the task set dictated by
    /// the plugin's capabilities otherwise.
    ///
    /// Watcher batches are handled by the caller; this method only
    /// maintains the plugin usage bookkeeping for watched items.
    pub fn add_request(
        &mut self,
        store: &mut PluginStore,
        pid: PluginId,
        request: &Request,
        key: String,
        params: Vec<String>,
        now: DateTime<Utc>,
        first_active_checks_refreshed: bool,
    ) -> Result<(), SchedulerError> {
        let handle = store.get(pid).handle();
        let first_use = !self.plugins_info.contains_key(&pid);

        if handle.exporter().is_some() {
            // built-in clients without an update interval ask for a
            // one-shot check; everything else is a recurring poll
            if self.is_builtin() && request.delay.is_empty() {
                self.add_direct_check(store, pid, request, key, params, now)?;
            } else {
                self.add_active_check(
                    store,
                    pid,
                    request,
                    key,
                    params,
                    now,
                    first_active_checks_refreshed,
                )?;
            }
        }

        // collector and starter tasks accompany the first activation of
        // the plugin, regardless of which item triggered it
        if store.get(pid).refcount() == 0 {
            if let Some(collector) = handle.collector() {
                let seed = crate::task::key_seed(handle.name());
                match Task::new_collector(pid, collector.period(), seed, now) {
                    Ok(task) => {
                        store.get_mut(pid).enqueue_task(task);
                        debug!(
                            "[{}] created collector task for plugin {}",
                            self.id,
                            handle.name()
                        );
                    }
                    Err(err) => debug!(
                        "[{}] cannot schedule collector task for plugin {}: {err}",
                        self.id,
                        handle.name()
                    ),
                }
            }
            if handle.runner().is_some() {
                if let Ok(task) = Task::new_starter(pid, now) {
                    store.get_mut(pid).enqueue_task(task);
                    debug!(
                        "[{}] created starter task for plugin {}",
                        self.id,
                        handle.name()
                    );
                }
            }
        }

        if first_use {
            store.get_mut(pid).add_ref();
        }
        self.plugins_info
            .entry(pid)
            .and_modify(|info| info.used = now)
            .or_insert(PluginUsage { used: now });
        Ok(())
    }

    fn add_direct_check(
        &mut self,
        store: &mut PluginStore,
        pid: PluginId,
        request: &Request,
        key: String,
        params: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let payload = ExporterPayload {
            client: self.id,
            itemid: request.itemid,
            item: ItemSnapshot {
                key,
                params,
                delay: 0,
            },
            sink: self.sink(),
            expressions: self.expressions(),
        };
        let task = Task::new_direct_exporter(pid, payload, now)?;
        store.get_mut(pid).enqueue_task(task);
        Ok(())
    }

    fn add_active_check(
        &mut self,
        store: &mut PluginStore,
        pid: PluginId,
        request: &Request,
        key: String,
        params: Vec<String>,
        now: DateTime<Utc>,
        first_active_checks_refreshed: bool,
    ) -> Result<(), SchedulerError> {
        let delay = parse_delay(&request.delay)?;
        let item = ItemSnapshot { key, params, delay };
        let client_id = self.id;

        let mut rebound = false;
        if let Some(sub) = self.exporters.get_mut(&request.itemid) {
            if sub.plugin == pid {
                let delay_changed = sub.item.delay != delay;
                let key_changed = sub.raw_key != request.key;
                sub.raw_key = request.key.clone();
                sub.item = item.clone();
                sub.updated = now;
                if delay_changed || key_changed {
                    store.get_mut(pid).refresh_exporter_task(
                        client_id,
                        request.itemid,
                        item,
                        delay_changed,
                        now,
                    );
                }
                return Ok(());
            }
            rebound = true;
        }
        if rebound {
            // the key moved to another plugin (reload); drop the old
            // subscription and create a fresh one below
            self.deactivate_exporter(store, request.itemid);
        }

        let immediate =
            store.get(pid).force_active_checks_on_start() && !first_active_checks_refreshed;
        let payload = ExporterPayload {
            client: self.id,
            itemid: request.itemid,
            item: item.clone(),
            sink: self.sink(),
            expressions: self.expressions(),
        };
        let task = Task::new_exporter(pid, payload, now, immediate)?;
        store.get_mut(pid).enqueue_task(task);
        self.exporters.insert(
            request.itemid,
            ExporterSub {
                plugin: pid,
                raw_key: request.key.clone(),
                item,
                updated: now,
            },
        );
        Ok(())
    }

    /// Releases plugins this client stopped using and prunes stale
    /// exporter subscriptions. Returns the plugins whose reference was
    /// dropped; the caller decides about deactivation.
    ///
    /// A real consumer releases everything the current refresh did not
    /// mention; a built-in client keeps one-shot check plugins alive for
    /// an hour past their last use.
    pub fn cleanup(&mut self, store: &mut PluginStore, now: DateTime<Utc>) -> Vec<PluginId> {
        let mut released = Vec::new();
        let builtin = self.is_builtin();
        self.plugins_info.retain(|pid, info| {
            let expired = if builtin {
                (now - info.used).num_seconds() >= DIRECT_CHECK_LIFETIME_SECS
            } else {
                info.used < now
            };
            if expired {
                store.get_mut(*pid).release_ref();
                released.push(*pid);
            }
            !expired
        });

        if !builtin {
            let stale: Vec<u64> = self
                .exporters
                .iter()
                .filter(|(_, sub)| sub.updated < now || released.contains(&sub.plugin))
                .map(|(itemid, _)| *itemid)
                .collect();
            for itemid in stale {
                debug!("[{}] releasing subscription for item {itemid}", self.id);
                self.deactivate_exporter(store, itemid);
            }
        }
        released
    }
}
