//! Fair-share pending task queue.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::time::Instant;

use super::task::TaskEntry;

/// A single pending queue entry.
struct PendingTask {
    /// The time at which the task entered the queue.
    enqueued_at: Instant,
    /// The queued task.
    entry: Arc<TaskEntry>,
}

/// A fair-share queue partitioned by fairness key.
///
/// `pop` selects the non-empty partition with the fewest currently running tasks, breaking ties
/// by the oldest head-of-line enqueue time and then by the lowest key, which approximates
/// per-collection fairness without starving small tenants behind large ones.
#[derive(Default)]
pub struct FairQueue {
    /// Pending tasks partitioned by fairness key.
    partitions: BTreeMap<i64, VecDeque<PendingTask>>,
    /// An index of queued task IDs to their partition key.
    index: HashMap<i64, i64>,
    /// The number of running tasks per partition key.
    running: HashMap<i64, usize>,
}

impl FairQueue {
    /// Push the given task, deduplicating by task ID. Returns false if already queued.
    pub fn push(&mut self, entry: Arc<TaskEntry>) -> bool {
        if self.index.contains_key(&entry.task_id) {
            return false;
        }
        self.index.insert(entry.task_id, entry.fairness_key);
        self.partitions.entry(entry.fairness_key).or_default().push_back(PendingTask {
            enqueued_at: Instant::now(),
            entry,
        });
        true
    }

    /// Pop one task from the least-busy partition.
    pub fn pop(&mut self) -> Option<Arc<TaskEntry>> {
        let mut best: Option<(usize, Instant, i64)> = None;
        for (key, queue) in &self.partitions {
            let head = match queue.front() {
                Some(head) => head.enqueued_at,
                None => continue,
            };
            let running = self.running.get(key).copied().unwrap_or(0);
            let candidate = (running, head, *key);
            if best.map(|current| candidate < current).unwrap_or(true) {
                best = Some(candidate);
            }
        }
        let key = best?.2;
        let item = self.partitions.get_mut(&key)?.pop_front()?;
        if self.partitions.get(&key).map(|queue| queue.is_empty()).unwrap_or(false) {
            self.partitions.remove(&key);
        }
        self.index.remove(&item.entry.task_id);
        Some(item.entry)
    }

    /// Remove the target task from the queue, returning it if present.
    pub fn remove(&mut self, task_id: i64) -> Option<Arc<TaskEntry>> {
        let key = self.index.remove(&task_id)?;
        let queue = self.partitions.get_mut(&key)?;
        let pos = queue.iter().position(|item| item.entry.task_id == task_id)?;
        let item = queue.remove(pos)?;
        if queue.is_empty() {
            self.partitions.remove(&key);
        }
        Some(item.entry)
    }

    /// Get the target task without removing it.
    pub fn get(&self, task_id: i64) -> Option<Arc<TaskEntry>> {
        let key = self.index.get(&task_id)?;
        self.partitions
            .get(key)?
            .iter()
            .find(|item| item.entry.task_id == task_id)
            .map(|item| item.entry.clone())
    }

    /// Check if the target task is queued.
    pub fn contains(&self, task_id: i64) -> bool {
        self.index.contains_key(&task_id)
    }

    /// The IDs of all queued tasks.
    pub fn task_ids(&self) -> Vec<i64> {
        self.index.keys().copied().collect()
    }

    /// The total number of queued tasks.
    pub fn task_count(&self) -> usize {
        self.index.len()
    }

    /// Record that a task of the given partition has started running.
    pub fn inc_running(&mut self, key: i64) {
        *self.running.entry(key).or_default() += 1;
    }

    /// Record that a task of the given partition has stopped running.
    pub fn dec_running(&mut self, key: i64) {
        match self.running.get_mut(&key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.running.remove(&key);
            }
            None => {}
        }
    }
}
