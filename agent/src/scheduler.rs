//! The task scheduler: a single-writer dispatch loop over plugin queues
//!
//! Exactly one spawned task (the loop in [`Manager::run`]) owns every
//! mutation of scheduler state: clients, plugin agents and the global
//! plugin queue. External callers talk to the loop through
//! [`SchedulerHandle`], which sends tagged events on one bounded
//! channel; they never touch shared state directly. Dispatched tasks
//! execute on blocking workers, touch only their own payload and the
//! client sink, and report back through the same channel.
//!
//! A 1 Hz ticker drives periodic progress. Each tick pops plugins whose
//! earliest task is due, dispatches tasks while the plugin has spare
//! capacity, and leaves capacity-exhausted plugins out of the queue
//! until a task finish releases a slot.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use metricd_core::plugin::{CheckResult, Metric, MetricRegistry, Plugin, Request, ResultWriter};
use metricd_core::{parse_key, ExpressionSet, SchedulerError};

use crate::alias::AliasManager;
use crate::client::{
    Client, LOCAL_CHECKS_CLIENT_ID, MAX_BUILTIN_CLIENT_ID, PASSIVE_CHECKS_CLIENT_ID,
};
use crate::config::AgentConfig;
use crate::keyaccess::KeyAccessRules;
use crate::plugin_agent::{
    effective_capacity, PluginAgent, PluginId, PluginStore, DEFAULT_MAX_CAPACITY,
};
use crate::queue::PluginQueue;
use crate::task::{Task, WatcherPayload};
use crate::userparams;

/// Seconds granted to plugins to finish during scheduler shutdown.
const SHUTDOWN_TIMEOUT_SECONDS: i32 = 5;
/// Shutdown timer value while no shutdown is in progress.
const SHUTDOWN_INACTIVE: i32 = -1;
/// Bounded capacity of the loop's input channel; senders block when the
/// loop falls behind.
const INPUT_CHANNEL_CAPACITY: usize = 10;
/// Tick-to-tick wall clock difference that triggers a queue rebuild.
const CLOCK_JUMP_LIMIT_SECONDS: i64 = 10;
/// Cadence of the passive-client cleanup and dead-client sweep.
const CLIENT_CLEANUP_INTERVAL_SECONDS: i64 = 3_600;

/// Tagged events serialized through the loop's input channel.
pub(crate) enum SchedulerEvent {
    Update(UpdateRequest),
    TaskFinished(Box<Task>),
    Query {
        command: String,
        sink: oneshot::Sender<String>,
    },
    ReloadUserParams {
        sink: oneshot::Sender<String>,
    },
    Shutdown,
}

/// List of metrics monitored by a client plus its configuration data.
pub(crate) struct UpdateRequest {
    pub client_id: u64,
    pub sink: Arc<dyn ResultWriter>,
    pub first_active_checks_refreshed: bool,
    pub expressions: Arc<ExpressionSet>,
    pub requests: Vec<Request>,
}

/// Cloneable entry point into the scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    input: mpsc::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    /// Subscribes or refreshes a client's monitored metrics. Results are
    /// delivered asynchronously to `sink`.
    pub async fn update_tasks(
        &self,
        client_id: u64,
        sink: Arc<dyn ResultWriter>,
        first_active_checks_refreshed: bool,
        expressions: Arc<ExpressionSet>,
        requests: Vec<Request>,
    ) {
        let _ = self
            .input
            .send(SchedulerEvent::Update(UpdateRequest {
                client_id,
                sink,
                first_active_checks_refreshed,
                expressions,
                requests,
            }))
            .await;
    }

    /// Synchronously evaluates a single item on behalf of `client_id`.
    ///
    /// On timeout the in-flight check keeps running; its late result is
    /// discarded by the dropped one-slot sink.
    pub async fn perform_task(
        &self,
        key: &str,
        timeout: Duration,
        client_id: u64,
    ) -> std::result::Result<String, SchedulerError> {
        let (tx, mut rx) = mpsc::channel(1);
        let sink: Arc<dyn ResultWriter> = Arc::new(SingleResultSink { tx });
        self.update_tasks(
            client_id,
            sink,
            false,
            Arc::new(ExpressionSet::default()),
            vec![Request {
                itemid: 0,
                key: key.to_string(),
                delay: String::new(),
                last_logsize: Some(0),
                mtime: Some(0),
            }],
        )
        .await;

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(result)) => {
                if let Some(message) = result.error {
                    if message == SchedulerError::Shutdown.to_string() {
                        return Err(SchedulerError::Shutdown);
                    }
                    return Err(SchedulerError::Plugin(message));
                }
                match result.value {
                    Some(value) => Ok(value),
                    // single metric requests do not support empty values
                    None => Err(SchedulerError::Plugin(
                        "No values have been gathered yet.".to_string(),
                    )),
                }
            }
            Ok(None) => Err(SchedulerError::Plugin(
                "No response from the scheduler.".to_string(),
            )),
            Err(_) => Err(SchedulerError::Timeout),
        }
    }

    /// Produces a textual status/debug response for `command`.
    pub async fn query(&self, command: &str) -> String {
        let (tx, rx) = oneshot::channel();
        let event = SchedulerEvent::Query {
            command: command.to_string(),
            sink: tx,
        };
        if self.input.send(event).await.is_err() {
            return "scheduler is not running".to_string();
        }
        rx.await
            .unwrap_or_else(|_| "scheduler is not running".to_string())
    }

    /// Reloads user-parameter metrics from the shared configuration.
    /// Answers "ok" or the reload error message.
    pub async fn query_user_params(&self) -> String {
        let (tx, rx) = oneshot::channel();
        if self
            .input
            .send(SchedulerEvent::ReloadUserParams { sink: tx })
            .await
            .is_err()
        {
            return "scheduler is not running".to_string();
        }
        rx.await
            .unwrap_or_else(|_| "scheduler is not running".to_string())
    }

    /// Requests shutdown and waits for the loop to exit. Repeated stops
    /// are harmless.
    pub async fn stop(&self) {
        let _ = self.input.send(SchedulerEvent::Shutdown).await;
        // the loop dropping its receiver closes the channel
        self.input.closed().await;
    }
}

/// One-slot sink backing `perform_task`. Writes after the first (or
/// after the caller gave up) are dropped.
struct SingleResultSink {
    tx: mpsc::Sender<CheckResult>,
}

impl ResultWriter for SingleResultSink {
    fn write(&self, result: CheckResult) {
        let _ = self.tx.try_send(result);
    }

    fn slots_available(&self) -> usize {
        self.tx.capacity()
    }
}

/// The scheduler state machine. All fields are owned by the loop.
pub struct Manager {
    input_rx: mpsc::Receiver<SchedulerEvent>,
    input_tx: mpsc::Sender<SchedulerEvent>,
    /// Metric key to owning plugin agent.
    plugins: HashMap<String, PluginId>,
    /// Metric key to human description, for status queries.
    key_info: HashMap<String, String>,
    store: PluginStore,
    queue: PluginQueue,
    clients: HashMap<u64, Client>,
    aliases: AliasManager,
    key_rules: KeyAccessRules,
    config: Arc<RwLock<AgentConfig>>,
    /// Number of tasks currently running on workers.
    active_tasks: usize,
    /// Seconds left on the shutdown timer, [`SHUTDOWN_INACTIVE`] while
    /// not shutting down.
    shutdown_seconds: i32,
}

impl Manager {
    /// Builds the scheduler from the registered metrics and the shared
    /// agent configuration. Configurator-capable plugins are validated
    /// and configured here; a validation failure aborts construction.
    pub async fn new(
        registry: &MetricRegistry,
        config: Arc<RwLock<AgentConfig>>,
    ) -> Result<(Manager, SchedulerHandle)> {
        let cfg = config.read().await.clone();
        let aliases = AliasManager::new(&cfg.aliases)?;
        let key_rules = KeyAccessRules::compile(&cfg.allow_keys, &cfg.deny_keys)?;

        let mut metrics: Vec<&Metric> = registry.iter().collect();
        metrics.sort_by(|a, b| {
            a.plugin
                .name()
                .cmp(b.plugin.name())
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut store = PluginStore::new();
        let mut plugins = HashMap::new();
        let mut key_info = HashMap::new();
        let mut current: Option<(Arc<dyn Plugin>, PluginId)> = None;

        for metric in metrics {
            // metrics are sorted by plugin, consecutive ones share an agent
            let reuse = current
                .as_ref()
                .and_then(|(plugin, pid)| Arc::ptr_eq(plugin, &metric.plugin).then_some(*pid));
            let pid = match reuse {
                Some(pid) => pid,
                None => {
                    let name = metric.plugin.name().to_string();
                    let options = cfg.plugin_options(&name);
                    if let Some(configurator) = metric.plugin.configurator() {
                        let raw = options.and_then(|o| o.options.as_ref());
                        configurator
                            .validate(raw)
                            .map_err(|err| SchedulerError::Config {
                                plugin: name.clone(),
                                message: format!("{err:#}"),
                            })?;
                        configurator.configure(raw);
                    }
                    let capacity = effective_capacity(
                        options.and_then(|o| o.capacity),
                        metric.plugin.max_capacity(),
                        &name,
                    );
                    let force = options
                        .and_then(|o| o.force_active_checks_on_start)
                        .unwrap_or(cfg.force_active_checks_on_start);
                    info!(
                        "using plugin '{}' providing following interfaces: {}, \
                         maximum capacity: {}, active checks on start enabled: {}",
                        name,
                        plugin_interface_names(metric.plugin.as_ref()),
                        capacity,
                        force
                    );
                    let pid = store.insert(PluginAgent::new(
                        Arc::clone(&metric.plugin),
                        capacity,
                        metric.user_param,
                        force,
                    ));
                    current = Some((Arc::clone(&metric.plugin), pid));
                    pid
                }
            };
            plugins.insert(metric.key.clone(), pid);
            key_info.insert(metric.key.clone(), metric.description.clone());
        }

        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let handle = SchedulerHandle {
            input: input_tx.clone(),
        };
        let manager = Manager {
            input_rx,
            input_tx,
            plugins,
            key_info,
            store,
            queue: PluginQueue::new(),
            clients: HashMap::new(),
            aliases,
            key_rules,
            config,
            active_tasks: 0,
            shutdown_seconds: SHUTDOWN_INACTIVE,
        };
        Ok((manager, handle))
    }

    /// The loop. Runs until a shutdown drains or times out.
    pub async fn run(mut self) {
        debug!("starting scheduler");
        // Align the ticker with the next second boundary; the few
        // microseconds past it are enough to include every task
        // scheduled for that second despite nanosecond priorities.
        let start = Utc::now();
        let to_boundary = 1_000_000_000u32.saturating_sub(start.nanosecond());
        tokio::time::sleep(Duration::from_nanos(u64::from(to_boundary))).await;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_tick = Utc::now();
        let mut cleaned = last_tick;
        'run: loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let diff = (now - last_tick).num_seconds();
                    if diff.abs() >= CLOCK_JUMP_LIMIT_SECONDS {
                        warn!(
                            "detected {} second time difference between queue checks, \
                             rescheduling tasks",
                            diff.abs()
                        );
                        self.reschedule_queue(now);
                    }
                    last_tick = now;
                    self.process_queue(now);
                    if self.shutdown_seconds != SHUTDOWN_INACTIVE {
                        self.shutdown_seconds -= 1;
                        if self.shutdown_seconds <= 0 {
                            break 'run;
                        }
                    } else if (now - cleaned).num_seconds() >= CLIENT_CLEANUP_INTERVAL_SECONDS {
                        self.hourly_maintenance(now);
                        cleaned = now;
                    }
                }
                event = self.input_rx.recv() => {
                    let Some(event) = event else { break 'run };
                    match event {
                        SchedulerEvent::Shutdown => {
                            if self.shutdown_seconds == SHUTDOWN_INACTIVE {
                                self.deactivate_plugins(Utc::now());
                            }
                            if self.active_tasks + self.queue.len() == 0 {
                                break 'run;
                            }
                            self.process_queue(Utc::now());
                        }
                        SchedulerEvent::Update(update) => {
                            let now = Utc::now();
                            self.process_update_request(update, now);
                            self.process_queue(now);
                        }
                        SchedulerEvent::TaskFinished(task) => {
                            let now = Utc::now();
                            self.process_finish_request(task, now);
                            if self.shutdown_seconds != SHUTDOWN_INACTIVE
                                && self.active_tasks + self.queue.len() == 0
                            {
                                break 'run;
                            }
                            self.process_queue(now);
                        }
                        SchedulerEvent::Query { command, sink } => {
                            let _ = sink.send(self.process_query(&command));
                        }
                        SchedulerEvent::ReloadUserParams { sink } => {
                            let response = self.process_user_param_reload(Utc::now()).await;
                            let _ = sink.send(response);
                        }
                    }
                }
            }
        }
        debug!("scheduler has been stopped");
    }

    /// Dispatches every due task whose plugin has spare capacity.
    pub(crate) fn process_queue(&mut self, now: DateTime<Utc>) {
        let seconds = now.timestamp();
        while let Some(pid) = self.queue.peek() {
            let Some(scheduled) = self.store.get(pid).peek_scheduled() else {
                // plugins with an empty task queue do not belong here
                self.queue.pop(&mut self.store);
                continue;
            };
            if scheduled.timestamp() > seconds {
                break;
            }
            self.queue.pop(&mut self.store);
            if !self.store.get(pid).has_capacity() {
                // keep the plugin out of the queue until an active task
                // finishes and the required capacity is released
                continue;
            }
            let Some(task) = self.store.get_mut(pid).pop_task() else {
                continue;
            };
            if !task.is_active() {
                // deactivated while queued; discard without performing
                self.requeue_plugin(pid);
                continue;
            }
            self.store.get_mut(pid).reserve_capacity();
            self.active_tasks += 1;
            self.dispatch(task);
            self.requeue_plugin(pid);
        }
    }

    /// Puts a plugin back where the queue-membership invariant says it
    /// belongs: queued exactly while it has pending tasks and spare
    /// capacity.
    fn requeue_plugin(&mut self, pid: PluginId) {
        if self.store.get(pid).queued() {
            self.queue.update(&mut self.store, pid);
        } else {
            let agent = self.store.get(pid);
            if agent.has_tasks() && agent.has_capacity() {
                self.queue.push(&mut self.store, pid);
            }
        }
    }

    /// Hands a task to a blocking worker. The worker owns the task for
    /// the duration of the call and returns it through the input
    /// channel; a panicking plugin is converted into an error result.
    fn dispatch(&mut self, mut task: Box<Task>) {
        let plugin = self.store.get(task.plugin()).handle();
        let input = self.input_tx.clone();
        debug!(
            "dispatching {} task for plugin {}",
            task.kind_name(),
            plugin.name()
        );
        tokio::task::spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.perform(plugin.as_ref())));
            if outcome.is_err() {
                error!(
                    "plugin {} panicked while performing a {} task",
                    plugin.name(),
                    task.kind_name()
                );
                task.fail("Plugin terminated unexpectedly while gathering data.");
            }
            // a failed send means the loop already exited; the late
            // completion is dropped
            let _ = input.blocking_send(SchedulerEvent::TaskFinished(task));
        });
    }

    /// Handles a task returning from its worker: releases capacity,
    /// reschedules recurring work and repairs the plugin's queue
    /// position.
    pub(crate) fn process_finish_request(&mut self, mut task: Box<Task>, now: DateTime<Utc>) {
        self.active_tasks = self.active_tasks.saturating_sub(1);
        let pid = task.plugin();
        self.store.get_mut(pid).release_capacity();

        if self.store.get(pid).active()
            && task.is_active()
            && task.is_recurring()
            && self.refresh_exporter_snapshot(&mut task)
        {
            let kind = task.kind_name();
            match task.reschedule(now) {
                Ok(()) => self.store.get_mut(pid).enqueue_task(task),
                Err(err) => warn!(
                    "cannot reschedule {kind} task for plugin {}: {err}",
                    self.store.get(pid).name()
                ),
            }
        }

        self.requeue_plugin(pid);
    }

    /// Re-synchronizes a returning exporter task with the authoritative
    /// subscription record. Returns false when the subscription is gone
    /// or was rebound; the task is dropped in that case.
    fn refresh_exporter_snapshot(&self, task: &mut Task) -> bool {
        let pid = task.plugin();
        let Some(payload) = task.exporter_mut() else {
            return true;
        };
        let Some(client) = self.clients.get(&payload.client) else {
            return false;
        };
        let Some(sub) = client.exporter_sub(payload.itemid) else {
            return false;
        };
        if sub.plugin != pid {
            return false;
        }
        payload.item = sub.item.clone();
        true
    }

    /// Handles a client update: registers the client lazily, reconciles
    /// every request against its subscriptions and releases plugins the
    /// client stopped using. Used both for bulk refreshes from upstream
    /// consumers and for direct single-item checks.
    pub(crate) fn process_update_request(&mut self, update: UpdateRequest, now: DateTime<Utc>) {
        debug!(
            "[{}] processing update request ({} requests)",
            update.client_id,
            update.requests.len()
        );

        // immediately fail direct checks and ignore bulk requests when
        // shutting down
        if self.shutdown_seconds != SHUTDOWN_INACTIVE {
            if update.client_id <= MAX_BUILTIN_CLIENT_ID {
                if update.requests.len() == 1 {
                    update.sink.write(CheckResult::error(
                        update.requests[0].itemid,
                        SchedulerError::Shutdown.to_string(),
                        now,
                    ));
                } else {
                    warn!(
                        "[{}] direct checks can contain only single request while \
                         received {} requests",
                        update.client_id,
                        update.requests.len()
                    );
                }
            }
            return;
        }

        if !self.clients.contains_key(&update.client_id) {
            if update.requests.is_empty() {
                debug!(
                    "[{}] skipping empty update for unregistered client",
                    update.client_id
                );
                return;
            }
            debug!("[{}] registering new client", update.client_id);
            self.clients.insert(
                update.client_id,
                Client::new(update.client_id, Arc::clone(&update.sink)),
            );
        }
        let Some(client) = self.clients.get_mut(&update.client_id) else {
            return;
        };
        client.update_expressions(Arc::clone(&update.expressions));
        client.update_sink(Arc::clone(&update.sink));

        let mut touched: Vec<PluginId> = Vec::new();
        let mut watcher_batches: Vec<(PluginId, Vec<Request>)> = Vec::new();
        for request in &update.requests {
            let resolved = self.aliases.resolve(&request.key);
            let added = match parse_key(&resolved) {
                Err(err) => Err(SchedulerError::Plugin(format!("{err:#}"))),
                Ok((key, params)) => {
                    let permitted = update.client_id == LOCAL_CHECKS_CLIENT_ID
                        || self.key_rules.check(&key, &params);
                    match self.plugins.get(key.as_str()) {
                        Some(&pid) if permitted => client
                            .add_request(
                                &mut self.store,
                                pid,
                                request,
                                key,
                                params,
                                now,
                                update.first_active_checks_refreshed,
                            )
                            .map(|()| pid),
                        _ => Err(SchedulerError::UnknownMetric(key)),
                    }
                }
            };

            match added {
                Err(err) => {
                    if update.client_id > MAX_BUILTIN_CLIENT_ID {
                        // a failing item must not keep its old task alive
                        client.deactivate_exporter(&mut self.store, request.itemid);
                    }
                    update
                        .sink
                        .write(CheckResult::error(request.itemid, err.to_string(), now));
                    debug!(
                        "[{}] cannot monitor metric \"{}\": {}",
                        update.client_id, request.key, err
                    );
                }
                Ok(pid) => {
                    if self.store.get(pid).handle().watcher().is_some() {
                        match watcher_batches.iter_mut().find(|(id, _)| *id == pid) {
                            Some((_, requests)) => requests.push(request.clone()),
                            None => watcher_batches.push((pid, vec![request.clone()])),
                        }
                    }
                    touched.push(pid);
                }
            }
        }

        // watched items travel as one batch per plugin
        for (pid, requests) in watcher_batches {
            let payload = WatcherPayload {
                client: update.client_id,
                requests,
                sink: client.sink(),
                expressions: client.expressions(),
            };
            match Task::new_watcher(pid, payload, now) {
                Ok(watcher_task) => self.store.get_mut(pid).enqueue_task(watcher_task),
                Err(err) => warn!(
                    "cannot schedule watcher task for plugin {}: {err}",
                    self.store.get(pid).name()
                ),
            }
        }

        for pid in touched {
            self.requeue_plugin(pid);
        }
        self.cleanup_client(update.client_id, now);
    }

    /// Deactivates plugins the client is not using anymore. Called
    /// after every client update and hourly for the passive-checks
    /// client.
    pub(crate) fn cleanup_client(&mut self, client_id: u64, now: DateTime<Utc>) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        let released = client.cleanup(&mut self.store, now);
        for pid in released {
            if self.store.get(pid).refcount() != 0 {
                continue;
            }
            debug!(
                "[{client_id}] deactivate unused plugin {}",
                self.store.get(pid).name()
            );
            self.store.get_mut(pid).deactivate_recurring_tasks();

            // queue a stopper task if the plugin has a Runner interface
            if self.store.get(pid).handle().runner().is_some() {
                match Task::new_stopper(pid, now) {
                    Ok(task) => {
                        self.store.get_mut(pid).enqueue_task(task);
                        debug!(
                            "[{client_id}] created stopper task for plugin {}",
                            self.store.get(pid).name()
                        );
                    }
                    Err(_) => debug!(
                        "[{client_id}] cannot schedule stopper task for plugin {}",
                        self.store.get(pid).name()
                    ),
                }
            }

            // keep the plugin queued while tasks remain to be finished
            // before deactivation
            self.requeue_plugin(pid);
        }
    }

    /// Rebuilds the queued plugins' schedules after a wall-clock jump.
    /// Tasks that cannot be rescheduled are dropped.
    pub(crate) fn reschedule_queue(&mut self, now: DateTime<Utc>) {
        // easier to rebuild the queues than to update each element
        let queued: Vec<PluginId> = self.queue.iter().collect();
        self.queue.clear(&mut self.store);
        for pid in queued {
            let tasks = self.store.get_mut(pid).take_tasks();
            for mut task in tasks {
                if task.reschedule(now).is_ok() {
                    self.store.get_mut(pid).enqueue_task(task);
                }
            }
            self.requeue_plugin(pid);
        }
    }

    /// Hourly housekeeping: reclaim plugins the passive-checks client
    /// stopped using and drop clients without subscriptions.
    pub(crate) fn hourly_maintenance(&mut self, now: DateTime<Utc>) {
        if self.clients.contains_key(&PASSIVE_CHECKS_CLIENT_ID) {
            self.cleanup_client(PASSIVE_CHECKS_CLIENT_ID, now);
        }
        self.clients.retain(|_, client| client.has_subscriptions());
    }

    /// Starts the shutdown sequence: every task heap is cleared, active
    /// Runner plugins get a final stopper task and all references drop.
    pub(crate) fn deactivate_plugins(&mut self, now: DateTime<Utc>) {
        self.shutdown_seconds = SHUTDOWN_TIMEOUT_SECONDS;
        info!(
            "shutting down scheduler, waiting up to {SHUTDOWN_TIMEOUT_SECONDS} seconds \
             for active tasks"
        );
        self.queue.clear(&mut self.store);
        let ids: Vec<PluginId> = self.store.ids().collect();
        for pid in ids {
            if self.store.get(pid).refcount() == 0 {
                continue;
            }
            self.store.get_mut(pid).clear_tasks();
            if self.store.get(pid).handle().runner().is_some() {
                if let Ok(task) = Task::new_stopper(pid, now) {
                    self.store.get_mut(pid).enqueue_task(task);
                    debug!(
                        "created final stopper task for plugin {}",
                        self.store.get(pid).name()
                    );
                }
            }
            self.store.get_mut(pid).clear_refs();
            // busy plugins re-enter the queue once a finish frees a slot
            self.requeue_plugin(pid);
        }
    }

    /// Answers a status/debug query.
    pub(crate) fn process_query(&self, command: &str) -> String {
        match command {
            "metrics" => {
                let mut keys: Vec<&String> = self.plugins.keys().collect();
                keys.sort();
                let mut out = String::new();
                for key in keys {
                    let agent = self.store.get(self.plugins[key]);
                    let description = self
                        .key_info
                        .get(key)
                        .map(String::as_str)
                        .unwrap_or_default();
                    let _ = writeln!(
                        out,
                        "{key}: {description} [plugin {}, capacity {}/{}, refcount {}]",
                        agent.name(),
                        agent.used_capacity(),
                        agent.max_capacity(),
                        agent.refcount()
                    );
                }
                out
            }
            "" | "status" => {
                let mut out = String::new();
                let _ = writeln!(out, "active tasks: {}", self.active_tasks);
                let _ = writeln!(out, "queued plugins: {}", self.queue.len());
                let _ = writeln!(out, "clients: {}", self.clients.len());
                let _ = writeln!(
                    out,
                    "shutting down: {}",
                    self.shutdown_seconds != SHUTDOWN_INACTIVE
                );
                out
            }
            other => format!("cannot process request: unknown command \"{other}\""),
        }
    }

    /// Replaces the user-parameter metric set from the shared
    /// configuration, preserving pending tasks whose keys survive.
    pub(crate) async fn process_user_param_reload(&mut self, now: DateTime<Utc>) -> String {
        let (definitions, unsafe_params) = {
            let cfg = self.config.read().await;
            (cfg.user_parameters.clone(), cfg.unsafe_user_parameters)
        };

        // compile first; a failing reload must leave the previous
        // metrics in place
        let new_metrics = match userparams::compile(&definitions, unsafe_params) {
            Ok(metrics) => metrics,
            Err(err) => {
                let response = SchedulerError::UserParamReload(format!("{err:#}")).to_string();
                warn!("{response}");
                return response;
            }
        };

        // run what is already due, then take the old plugins out
        self.flush_user_param_queue(now);

        let old_keys: Vec<String> = self
            .plugins
            .iter()
            .filter(|(_, pid)| self.store.get(**pid).is_user_param())
            .map(|(key, _)| key.clone())
            .collect();
        let mut preserved: Vec<Box<Task>> = Vec::new();
        for key in &old_keys {
            if let Some(pid) = self.plugins.remove(key) {
                preserved.extend(self.store.get_mut(pid).take_tasks());
                self.store.retire(pid);
            }
            self.key_info.remove(key);
        }

        let mut new_ids: HashMap<String, PluginId> = HashMap::new();
        for metric in &new_metrics {
            let pid = self.store.insert(PluginAgent::new(
                Arc::clone(&metric.plugin),
                DEFAULT_MAX_CAPACITY,
                true,
                false,
            ));
            // user-parameter plugins stay referenced for their lifetime
            self.store.get_mut(pid).add_ref();
            self.plugins.insert(metric.key.clone(), pid);
            self.key_info
                .insert(metric.key.clone(), metric.description.clone());
            new_ids.insert(metric.key.clone(), pid);
        }

        // rebind preserved tasks whose key still exists
        let mut dropped = 0usize;
        for mut task in preserved {
            let target = task.item_key().and_then(|key| new_ids.get(key)).copied();
            match target {
                Some(pid) => {
                    task.set_plugin(pid);
                    if let Some(payload) = task.exporter_mut() {
                        let (owner_id, itemid) = (payload.client, payload.itemid);
                        if let Some(owner) = self.clients.get_mut(&owner_id) {
                            owner.rebind_exporter(itemid, pid);
                        }
                    }
                    self.store.get_mut(pid).enqueue_task(task);
                }
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            debug!("dropped {dropped} user parameter tasks removed by the reload");
        }

        for pid in new_ids.values() {
            self.requeue_plugin(*pid);
        }
        info!("reloaded user parameters: {} metrics", new_metrics.len());
        "ok".to_string()
    }

    /// Dispatches every due user-parameter task and drops the
    /// user-parameter plugins from the queue; other plugins keep their
    /// positions. Runs right before the metric swap.
    fn flush_user_param_queue(&mut self, now: DateTime<Utc>) {
        let seconds = now.timestamp();
        let mut keep: Vec<PluginId> = Vec::new();
        while let Some(pid) = self.queue.pop(&mut self.store) {
            if !self.store.get(pid).is_user_param() {
                keep.push(pid);
                continue;
            }
            let ready = self
                .store
                .get(pid)
                .peek_scheduled()
                .is_some_and(|scheduled| scheduled.timestamp() <= seconds);
            if !ready || !self.store.get(pid).has_capacity() {
                continue;
            }
            if let Some(task) = self.store.get_mut(pid).pop_task() {
                if task.is_active() {
                    self.store.get_mut(pid).reserve_capacity();
                    self.active_tasks += 1;
                    self.dispatch(task);
                }
            }
        }
        for pid in keep {
            self.queue.push(&mut self.store, pid);
        }
    }

    // --- test access ---------------------------------------------------

    #[cfg(test)]
    pub(crate) fn input_receiver(&mut self) -> &mut mpsc::Receiver<SchedulerEvent> {
        &mut self.input_rx
    }

    #[cfg(test)]
    pub(crate) fn active_task_count(&self) -> usize {
        self.active_tasks
    }

    #[cfg(test)]
    pub(crate) fn queued_plugin_count(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn plugin_id(&self, key: &str) -> Option<PluginId> {
        self.plugins.get(key).copied()
    }

    #[cfg(test)]
    pub(crate) fn plugin_state(&self, id: PluginId) -> &PluginAgent {
        self.store.get(id)
    }

    #[cfg(test)]
    pub(crate) fn client_state(&self, id: u64) -> Option<&Client> {
        self.clients.get(&id)
    }

    #[cfg(test)]
    pub(crate) fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown_seconds != SHUTDOWN_INACTIVE
    }

    /// Queue-membership invariant: a plugin is queued exactly while it
    /// has pending tasks and spare capacity.
    #[cfg(test)]
    pub(crate) fn check_queue_membership(&self) -> bool {
        self.store
            .iter()
            .all(|(_, agent)| agent.queued() == (agent.has_tasks() && agent.has_capacity()))
    }
}

fn plugin_interface_names(plugin: &dyn Plugin) -> String {
    let mut names = Vec::with_capacity(5);
    if plugin.exporter().is_some() {
        names.push("exporter");
    }
    if plugin.collector().is_some() {
        names.push("collector");
    }
    if plugin.runner().is_some() {
        names.push("runner");
    }
    if plugin.watcher().is_some() {
        names.push("watcher");
    }
    if plugin.configurator().is_some() {
        names.push("configurator");
    }
    names.join(", ")
}
