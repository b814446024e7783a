//! Index-tracked binary min-heaps for tasks and plugins
//!
//! Tasks sit in per-plugin heaps ordered by scheduled time; plugins sit
//! in the global queue ordered by their earliest task. Both element
//! types store their current heap position so a mutation deeper in the
//! structure can be repaired in O(log n) with an explicit `update` call
//! instead of a rebuild.

use chrono::{DateTime, Utc};

use crate::plugin_agent::{PluginId, PluginStore};
use crate::task::Task;

/// Min-heap of tasks by scheduled time, owned by one plugin.
#[derive(Default)]
pub(crate) struct TaskQueue {
    tasks: Vec<Box<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn peek(&self) -> Option<&Task> {
        self.tasks.first().map(|t| t.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().map(|t| t.as_ref())
    }

    pub fn push(&mut self, mut task: Box<Task>) {
        let index = self.tasks.len();
        task.set_index(Some(index));
        self.tasks.push(task);
        self.sift_up(index);
    }

    pub fn pop(&mut self) -> Option<Box<Task>> {
        if self.tasks.is_empty() {
            return None;
        }
        self.remove(0)
    }

    /// Removes the task at `index`, restoring heap order afterwards.
    pub fn remove(&mut self, index: usize) -> Option<Box<Task>> {
        if index >= self.tasks.len() {
            return None;
        }
        debug_assert_eq!(self.tasks[index].index(), Some(index));
        let last = self.tasks.len() - 1;
        self.tasks.swap(index, last);
        let mut removed = self.tasks.pop().expect("non-empty heap");
        removed.set_index(None);
        if index < self.tasks.len() {
            self.tasks[index].set_index(Some(index));
            self.update(index);
        }
        Some(removed)
    }

    /// Repairs the heap after the task at `index` changed its scheduled
    /// time in place.
    pub fn update(&mut self, index: usize) {
        if index >= self.tasks.len() {
            return;
        }
        self.sift_up(index);
        self.sift_down(index);
    }

    /// Position of the first task matching `pred`, scanning heap order.
    pub fn position(&self, pred: impl Fn(&Task) -> bool) -> Option<usize> {
        self.tasks.iter().position(|t| pred(t))
    }

    /// Mutable access to a task in place. The caller must not change
    /// the scheduled time through this; use `remove` + `push` or
    /// `update` for that.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Task> {
        self.tasks.get_mut(index).map(|t| t.as_mut())
    }

    /// Takes every task out of the heap, clearing their indexes.
    pub fn drain(&mut self) -> Vec<Box<Task>> {
        let mut tasks = std::mem::take(&mut self.tasks);
        for task in &mut tasks {
            task.set_index(None);
        }
        tasks
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.tasks[a].scheduled() < self.tasks[b].scheduled()
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.tasks.swap(a, b);
        self.tasks[a].set_index(Some(a));
        self.tasks[b].set_index(Some(b));
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.tasks.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let mut smallest = left;
            let right = left + 1;
            if right < len && self.less(right, left) {
                smallest = right;
            }
            if !self.less(smallest, index) {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }
}

/// Global min-heap of plugins keyed by the earliest task in each
/// plugin's internal queue. A plugin whose stored index is `None` is not
/// in the queue.
#[derive(Default)]
pub(crate) struct PluginQueue {
    plugins: Vec<PluginId>,
}

impl PluginQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn peek(&self) -> Option<PluginId> {
        self.plugins.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = PluginId> + '_ {
        self.plugins.iter().copied()
    }

    pub fn push(&mut self, store: &mut PluginStore, id: PluginId) {
        debug_assert!(!store.get(id).queued());
        let index = self.plugins.len();
        store.get_mut(id).set_queue_index(Some(index));
        self.plugins.push(id);
        self.sift_up(store, index);
    }

    pub fn pop(&mut self, store: &mut PluginStore) -> Option<PluginId> {
        if self.plugins.is_empty() {
            return None;
        }
        let last = self.plugins.len() - 1;
        self.swap(store, 0, last);
        let id = self.plugins.pop().expect("non-empty heap");
        store.get_mut(id).set_queue_index(None);
        if !self.plugins.is_empty() {
            self.sift_down(store, 0);
        }
        Some(id)
    }

    /// Repairs the position of a queued plugin after its internal task
    /// heap changed.
    pub fn update(&mut self, store: &mut PluginStore, id: PluginId) {
        if let Some(index) = store.get(id).queue_index() {
            self.sift_up(store, index);
            self.sift_down(store, index);
        }
    }

    /// Empties the queue, clearing every plugin's stored index.
    pub fn clear(&mut self, store: &mut PluginStore) {
        for id in self.plugins.drain(..) {
            store.get_mut(id).set_queue_index(None);
        }
    }

    fn key(store: &PluginStore, id: PluginId) -> Option<DateTime<Utc>> {
        store.get(id).peek_scheduled()
    }

    fn less(&self, store: &PluginStore, a: usize, b: usize) -> bool {
        // a plugin with no tasks sorts after everything else
        match (
            Self::key(store, self.plugins[a]),
            Self::key(store, self.plugins[b]),
        ) {
            (Some(x), Some(y)) => x < y,
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn swap(&mut self, store: &mut PluginStore, a: usize, b: usize) {
        self.plugins.swap(a, b);
        store.get_mut(self.plugins[a]).set_queue_index(Some(a));
        store.get_mut(self.plugins[b]).set_queue_index(Some(b));
    }

    fn sift_up(&mut self, store: &mut PluginStore, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(store, index, parent) {
                break;
            }
            self.swap(store, index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, store: &mut PluginStore, mut index: usize) {
        let len = self.plugins.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let mut smallest = left;
            let right = left + 1;
            if right < len && self.less(store, right, left) {
                smallest = right;
            }
            if !self.less(store, smallest, index) {
                break;
            }
            self.swap(store, index, smallest);
            index = smallest;
        }
    }
}
