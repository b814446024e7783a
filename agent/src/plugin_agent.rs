//! Per-plugin scheduler state
//!
//! A [`PluginAgent`] pairs the opaque plugin capability handle with the
//! scheduler's bookkeeping for it: the internal task heap, the
//! used/maximum capacity counters, the client reference count and the
//! plugin's position in the global queue. Agents live in a
//! [`PluginStore`] arena and are addressed by [`PluginId`]; retired
//! agents (replaced during user-parameter reload) keep their slot so
//! in-flight tasks can still report back safely.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use metricd_core::plugin::Plugin;

use crate::queue::TaskQueue;
use crate::task::{ItemSnapshot, Task};

/// Default plugin capacity used when neither system settings nor the
/// plugin itself provide one.
pub(crate) const DEFAULT_CAPACITY: usize = 100;
/// Hard capacity cap applied when the plugin declares no maximum.
pub(crate) const DEFAULT_MAX_CAPACITY: usize = 1_000;

/// Stable handle of a plugin agent inside the [`PluginStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PluginId(usize);

pub(crate) struct PluginAgent {
    handle: Arc<dyn Plugin>,
    tasks: TaskQueue,
    used_capacity: usize,
    max_capacity: usize,
    /// Number of clients currently using this plugin.
    refcount: usize,
    /// Position in the global plugin queue, `None` when not queued.
    queue_index: Option<usize>,
    user_param: bool,
    force_active_checks_on_start: bool,
    /// Detached by a reload; keeps its slot for in-flight tasks.
    retired: bool,
}

impl PluginAgent {
    pub fn new(
        handle: Arc<dyn Plugin>,
        max_capacity: usize,
        user_param: bool,
        force_active_checks_on_start: bool,
    ) -> Self {
        Self {
            handle,
            tasks: TaskQueue::new(),
            used_capacity: 0,
            max_capacity: max_capacity.max(1),
            refcount: 0,
            queue_index: None,
            user_param,
            force_active_checks_on_start,
            retired: false,
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> Arc<dyn Plugin> {
        Arc::clone(&self.handle)
    }

    pub fn is_user_param(&self) -> bool {
        self.user_param
    }

    pub fn force_active_checks_on_start(&self) -> bool {
        self.force_active_checks_on_start
    }

    /// A plugin is active while at least one client references it.
    pub fn active(&self) -> bool {
        self.refcount > 0
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn add_ref(&mut self) {
        self.refcount += 1;
    }

    /// Saturating: a client may release a reference into an agent that
    /// was already retired by a user-parameter reload.
    pub fn release_ref(&mut self) {
        self.refcount = self.refcount.saturating_sub(1);
    }

    pub fn clear_refs(&mut self) {
        self.refcount = 0;
    }

    // --- capacity -----------------------------------------------------

    pub fn has_capacity(&self) -> bool {
        self.used_capacity < self.max_capacity
    }

    pub fn used_capacity(&self) -> usize {
        self.used_capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// The caller must have checked `has_capacity` first.
    pub fn reserve_capacity(&mut self) {
        debug_assert!(self.used_capacity < self.max_capacity);
        self.used_capacity += 1;
    }

    pub fn release_capacity(&mut self) {
        debug_assert!(self.used_capacity > 0);
        self.used_capacity = self.used_capacity.saturating_sub(1);
    }

    // --- task heap ----------------------------------------------------

    pub fn enqueue_task(&mut self, task: Box<Task>) {
        self.tasks.push(task);
    }

    pub fn pop_task(&mut self) -> Option<Box<Task>> {
        self.tasks.pop()
    }

    /// Scheduled instant of the earliest queued task; the key this
    /// plugin sorts by in the global queue.
    pub fn peek_scheduled(&self) -> Option<DateTime<Utc>> {
        self.tasks.peek().map(|t| t.scheduled())
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    #[allow(dead_code)]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    #[allow(dead_code)]
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Removes the queued recurring exporter task of `(client, itemid)`,
    /// if present. In-flight tasks are unaffected; they are dropped on
    /// finish once their subscription is gone.
    pub fn remove_exporter_task(&mut self, client: u64, itemid: u64) -> Option<Box<Task>> {
        let index = self
            .tasks
            .position(|t| t.is_exporter_for(client, itemid))?;
        self.tasks.remove(index)
    }

    /// Pushes a changed item snapshot into the queued exporter task of
    /// `(client, itemid)`. With `reschedule` the task is also moved to
    /// its new grid slot; a plain key/parameter change leaves the heap
    /// position untouched.
    pub fn refresh_exporter_task(
        &mut self,
        client: u64,
        itemid: u64,
        item: ItemSnapshot,
        reschedule: bool,
        now: DateTime<Utc>,
    ) {
        let Some(index) = self.tasks.position(|t| t.is_exporter_for(client, itemid)) else {
            return;
        };
        if !reschedule {
            if let Some(payload) = self.tasks.get_mut(index).and_then(Task::exporter_mut) {
                payload.item = item;
            }
            return;
        }
        let Some(mut task) = self.tasks.remove(index) else {
            return;
        };
        if let Some(payload) = task.exporter_mut() {
            payload.item = item;
        }
        match task.reschedule(now) {
            Ok(()) => self.tasks.push(task),
            Err(err) => {
                warn!("dropping exporter task for item {itemid}: cannot reschedule: {err}")
            }
        }
    }

    /// Deactivates every active recurring task in one pass: the heap is
    /// drained, recurring tasks are marked and dropped, the remainder is
    /// pushed back.
    pub fn deactivate_recurring_tasks(&mut self) {
        for mut task in self.tasks.drain() {
            if task.is_active() && task.is_recurring() {
                task.deactivate();
            } else {
                self.tasks.push(task);
            }
        }
    }

    /// Drops every queued task (shutdown path).
    pub fn clear_tasks(&mut self) {
        self.tasks.drain();
    }

    /// Takes the whole task heap out (user-parameter reload rebind).
    pub fn take_tasks(&mut self) -> Vec<Box<Task>> {
        self.tasks.drain()
    }

    // --- global queue position ---------------------------------------

    pub fn queued(&self) -> bool {
        self.queue_index.is_some()
    }

    pub fn queue_index(&self) -> Option<usize> {
        self.queue_index
    }

    pub fn set_queue_index(&mut self, index: Option<usize>) {
        self.queue_index = index;
    }
}

/// Picks the effective capacity from the configured value and the
/// plugin-declared maximum. A configured value above the hard cap is
/// downgraded with a warning.
pub(crate) fn effective_capacity(
    configured: Option<usize>,
    plugin_max: usize,
    plugin_name: &str,
) -> usize {
    let capacity = match configured {
        Some(value) if value > 0 => value,
        _ => DEFAULT_CAPACITY,
    };
    let max_capacity = if plugin_max > 0 {
        plugin_max
    } else {
        DEFAULT_MAX_CAPACITY
    };
    if capacity > max_capacity {
        warn!(
            "lowering the plugin {plugin_name} capacity to hard limit {max_capacity} \
             as the configured capacity {capacity} exceeds limits"
        );
        return max_capacity;
    }
    capacity
}

/// Arena of plugin agents.
///
/// Slots are never reused: a retired agent stays addressable so that a
/// task finishing after a reload releases capacity on the agent that
/// reserved it.
#[derive(Default)]
pub(crate) struct PluginStore {
    agents: Vec<PluginAgent>,
}

impl PluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, agent: PluginAgent) -> PluginId {
        let id = PluginId(self.agents.len());
        self.agents.push(agent);
        id
    }

    pub fn get(&self, id: PluginId) -> &PluginAgent {
        &self.agents[id.0]
    }

    pub fn get_mut(&mut self, id: PluginId) -> &mut PluginAgent {
        &mut self.agents[id.0]
    }

    /// Detaches an agent replaced by reload. Remaining queued tasks are
    /// expected to have been taken out already.
    pub fn retire(&mut self, id: PluginId) {
        let agent = &mut self.agents[id.0];
        agent.retired = true;
        agent.refcount = 0;
        agent.clear_tasks();
    }

    #[allow(dead_code)]
    pub fn iter(&self) -> impl Iterator<Item = (PluginId, &PluginAgent)> {
        self.agents
            .iter()
            .enumerate()
            .map(|(i, agent)| (PluginId(i), agent))
    }

    pub fn ids(&self) -> impl Iterator<Item = PluginId> + '_ {
        (0..self.agents.len()).map(PluginId)
    }
}
