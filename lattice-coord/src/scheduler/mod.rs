//! Worker task scheduler.
//!
//! The scheduler holds two disjoint collections: a fair-share pending queue and a running map.
//! A dispatch loop drains the queue onto workers with free slots, a polling loop drives running
//! tasks through their state machines, and a metrics loop surfaces queue & run latency. All
//! three are independent controllers cancelled through the shared shutdown channel.

pub mod queue;
pub mod task;
#[cfg(test)]
mod mod_test;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::metastore::MetaStore;
use crate::models::{TaskKind, TaskState};
use crate::registry::{WorkerRegistry, WorkerSlots};
use crate::scheduler::queue::FairQueue;
use crate::scheduler::task::{task_from_record, Task, TaskEntry, TaskSnapshot, REASON_CANCELED};

const METRIC_PENDING_TASKS: &str = "lattice_coord_pending_tasks";
const METRIC_RUNNING_TASKS: &str = "lattice_coord_running_tasks";
const METRIC_TASK_QUEUE_LATENCY_MS: &str = "lattice_coord_task_queue_latency_ms";
const METRIC_TASK_RUN_LATENCY_MS: &str = "lattice_coord_task_run_latency_ms";

/// The cadence of the task metrics collection loop.
const COLLECT_METRICS_INTERVAL: Duration = Duration::from_secs(60);
/// The max number of recently finalized task snapshots retained for observability.
const RECENT_TASKS_CAP: usize = 512;
/// The retention window of recently finalized task snapshots.
const RECENT_TASKS_TTL: Duration = Duration::from_secs(60 * 15);

/// The outcome of polling a single running task.
enum PollOutcome {
    /// The task remains in the running map.
    Keep,
    /// The task has been finalized and leaves the running map.
    Evict,
    /// The task re-enters the pending queue.
    Requeue,
}

/// A live handle to the task scheduler.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

/// The runner half of the scheduler, consumed when its loops are spawned.
pub struct SchedulerRunner {
    inner: Arc<SchedulerInner>,
    notify_rx: mpsc::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
}

struct SchedulerInner {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The metadata store gateway.
    meta: MetaStore,
    /// The worker registry.
    registry: WorkerRegistry,

    /// The fair-share queue of tasks awaiting dispatch.
    pending: Mutex<FairQueue>,
    /// All tasks currently held by workers, keyed by task ID.
    running: Mutex<HashMap<i64, Arc<TaskEntry>>>,
    /// A bounded cache of recently finalized task snapshots.
    recent: Mutex<RecentTasks>,

    /// The edge-triggered dispatch signal.
    notify_tx: mpsc::Sender<()>,
    /// The polling fan-out limiter.
    poll_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    /// Create a new instance, rebuilding the pending queue and running map from the metadata
    /// store.
    pub async fn new(
        config: Arc<Config>, meta: MetaStore, registry: WorkerRegistry, shutdown_tx: broadcast::Sender<()>,
    ) -> Result<(Self, SchedulerRunner)> {
        metrics::register_gauge!(METRIC_PENDING_TASKS, metrics::Unit::Count, "number of tasks awaiting dispatch");
        metrics::register_gauge!(METRIC_RUNNING_TASKS, metrics::Unit::Count, "number of tasks currently held by workers");
        metrics::register_histogram!(METRIC_TASK_QUEUE_LATENCY_MS, metrics::Unit::Milliseconds, "task time spent queued before dispatch");
        metrics::register_histogram!(METRIC_TASK_RUN_LATENCY_MS, metrics::Unit::Milliseconds, "task time spent running on a worker");

        let (notify_tx, notify_rx) = mpsc::channel(1);
        let poll_semaphore = Arc::new(Semaphore::new(config.scheduler_poll_concurrency));
        let inner = Arc::new(SchedulerInner {
            config,
            meta,
            registry,
            pending: Mutex::new(FairQueue::default()),
            running: Mutex::new(HashMap::new()),
            recent: Mutex::new(RecentTasks::new(RECENT_TASKS_CAP, RECENT_TASKS_TTL)),
            notify_tx,
            poll_semaphore,
        });
        inner.reload_from_meta().await?;
        Ok((
            Self { inner: inner.clone() },
            SchedulerRunner {
                inner,
                notify_rx,
                shutdown_tx,
            },
        ))
    }

    /// Submit the given task, queueing it unless it is already tracked.
    pub async fn enqueue(&self, task: Box<dyn Task>) -> Result<()> {
        let entry = TaskEntry::new(task);
        let task_id = entry.task_id;
        if self.inner.running.lock().await.contains_key(&task_id) {
            return Ok(());
        }
        {
            let mut task = entry.inner.lock().await;
            task.set_queued_at(OffsetDateTime::now_utc());
        }
        let pushed = self.inner.pending.lock().await.push(entry);
        if pushed {
            tracing::info!(task_id, "task scheduler enqueued task");
        }
        self.notify();
        Ok(())
    }

    /// Wake the dispatch loop without blocking.
    pub fn notify(&self) {
        let _res = self.inner.notify_tx.try_send(());
    }

    /// Check if the target task is currently tracked.
    pub async fn exists(&self, task_id: i64) -> bool {
        if self.inner.pending.lock().await.contains(task_id) {
            return true;
        }
        self.inner.running.lock().await.contains_key(&task_id)
    }

    /// Abort the target task.
    ///
    /// The task is marked failed with reason "canceled" and moved into the running map, where
    /// the polling loop finalizes and evicts it.
    pub async fn abort(&self, task_id: i64) {
        tracing::info!(task_id, "task scheduler received abort request");
        let from_pending = self.inner.pending.lock().await.remove(task_id);
        if let Some(entry) = from_pending {
            {
                let mut task = entry.inner.lock().await;
                task.set_state(TaskState::Failed, REASON_CANCELED);
            }
            self.inner.insert_running(entry).await;
            return;
        }
        let running = self.inner.running.lock().await.get(&task_id).cloned();
        if let Some(entry) = running {
            let mut task = entry.inner.lock().await;
            task.set_state(TaskState::Failed, REASON_CANCELED);
        }
    }

    /// A snapshot of the target task's externally visible state.
    ///
    /// Recently finalized tasks remain observable for a bounded retention window.
    pub async fn task_stats(&self, task_id: i64) -> Option<TaskSnapshot> {
        let pending = self.inner.pending.lock().await.get(task_id);
        if let Some(entry) = pending {
            return Some(entry.inner.lock().await.snapshot());
        }
        let running = self.inner.running.lock().await.get(&task_id).cloned();
        if let Some(entry) = running {
            return Some(entry.inner.lock().await.snapshot());
        }
        self.inner.recent.lock().await.get(task_id)
    }
}

impl SchedulerRunner {
    /// Spawn the dispatch, polling & metrics loops.
    pub fn spawn(self) -> Vec<JoinHandle<Result<()>>> {
        let dispatch = tokio::spawn(SchedulerInner::run_dispatch(
            self.inner.clone(),
            self.notify_rx,
            BroadcastStream::new(self.shutdown_tx.subscribe()),
        ));
        let poll = tokio::spawn(SchedulerInner::run_poll(
            self.inner.clone(),
            BroadcastStream::new(self.shutdown_tx.subscribe()),
        ));
        let collect = tokio::spawn(SchedulerInner::run_metrics(
            self.inner,
            BroadcastStream::new(self.shutdown_tx.subscribe()),
        ));
        vec![dispatch, poll, collect]
    }
}

impl SchedulerInner {
    /// Rebuild the pending queue and running map from persisted task records.
    async fn reload_from_meta(self: &Arc<Self>) -> Result<()> {
        for kind in [TaskKind::IndexBuild, TaskKind::Analyze, TaskKind::Stats] {
            for record in self.meta.list_tasks(kind).await? {
                let state = record.task_state();
                let task = match task_from_record(record, &self.config.cluster_name) {
                    Ok(task) => task,
                    Err(err) => {
                        tracing::error!(error = ?err, "corrupt task record during scheduler recovery, skipping");
                        continue;
                    }
                };
                let entry = TaskEntry::new(task);
                match state {
                    TaskState::None | TaskState::Init => {
                        self.pending.lock().await.push(entry);
                    }
                    TaskState::InProgress | TaskState::Retry => {
                        self.insert_running(entry).await;
                    }
                    // Terminal states were already finalized before the restart.
                    TaskState::Finished | TaskState::Failed => {}
                }
            }
        }
        let pending = self.pending.lock().await.task_count();
        let running = self.running.lock().await.len();
        tracing::info!(pending, running, "task scheduler recovered from metadata");
        Ok(())
    }

    async fn run_dispatch(self: Arc<Self>, mut notify_rx: mpsc::Receiver<()>, mut shutdown: BroadcastStream<()>) -> Result<()> {
        tracing::info!("task scheduler dispatch loop started");
        let mut ticker = tokio::time::interval(self.config.scheduler_interval());
        loop {
            tokio::select! {
                Some(_) = notify_rx.recv() => self.dispatch_pass().await,
                _ = ticker.tick() => self.dispatch_pass().await,
                _ = shutdown.next() => break,
            }
        }
        tracing::debug!("task scheduler dispatch loop has shutdown");
        Ok(())
    }

    async fn run_poll(self: Arc<Self>, mut shutdown: BroadcastStream<()>) -> Result<()> {
        tracing::info!("task scheduler polling loop started");
        let mut ticker = tokio::time::interval(self.config.scheduler_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_pass().await,
                _ = shutdown.next() => break,
            }
        }
        tracing::debug!("task scheduler polling loop has shutdown");
        Ok(())
    }

    async fn run_metrics(self: Arc<Self>, mut shutdown: BroadcastStream<()>) -> Result<()> {
        let mut ticker = tokio::time::interval(COLLECT_METRICS_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.collect_task_metrics().await,
                _ = shutdown.next() => break,
            }
        }
        Ok(())
    }

    /// Execute one dispatch pass over the pending queue.
    ///
    /// A single slot snapshot is taken up front and mutated locally as tasks are placed; the
    /// registry's authoritative view is never touched. The pass ends with a barrier so that two
    /// passes never overlap.
    async fn dispatch_pass(self: &Arc<Self>) {
        let pending_count = self.pending.lock().await.task_count();
        if pending_count == 0 {
            return;
        }
        let mut slots = self.registry.query_all_slots().await;
        tracing::debug!(pending = pending_count, workers = slots.len(), "task dispatch pass");

        let mut handles = Vec::new();
        loop {
            if !has_available_slots(&slots) {
                break;
            }
            let entry = match self.pending.lock().await.pop() {
                Some(entry) => entry,
                None => break,
            };
            let node_id = pick_node(&mut slots, entry.slot_cost);
            let inner = self.clone();
            handles.push(tokio::spawn(async move { inner.dispatch_task(entry, node_id).await }));
        }
        for handle in handles {
            let _res = handle.await;
        }
    }

    /// Drive one popped task through its init sequence and route it by its resulting state.
    async fn dispatch_task(self: Arc<Self>, entry: Arc<TaskEntry>, node_id: i64) {
        let state = {
            let mut task = entry.inner.lock().await;
            if node_id != -1 {
                self.process(&mut *task, node_id).await;
            }
            task.state()
        };
        match state {
            TaskState::None => {
                let dropped = {
                    let task = entry.inner.lock().await;
                    task.drop_task_meta(&self.meta).await
                };
                if let Err(err) = dropped {
                    tracing::warn!(error = ?err, task_id = entry.task_id, "error purging task metadata, requeueing");
                    self.pending.lock().await.push(entry);
                }
            }
            TaskState::Init => {
                self.pending.lock().await.push(entry);
            }
            _ => self.insert_running(entry).await,
        }
    }

    /// Process one popped task under its key lock.
    async fn process(&self, task: &mut Box<dyn Task>, node_id: i64) {
        tracing::info!(
            task_id = task.task_id(),
            node = node_id,
            kind = task.kind().as_str(),
            state = ?task.state(),
            "task is processing",
        );
        match task.state() {
            TaskState::Init => self.process_init(task, node_id).await,
            // Routed by the caller without worker involvement.
            TaskState::None => {}
            state => tracing::error!(task_id = task.task_id(), ?state, "invalid task state in pending queue"),
        }
    }

    /// Drive the init sequence of a freshly popped task.
    async fn process_init(&self, task: &mut Box<dyn Task>, node_id: i64) {
        // Determine whether the task can be performed or if it is truly necessary.
        if !task.pre_check(&self.meta).await {
            return;
        }
        let client = match self.registry.get_client(node_id) {
            Some(client) => client,
            None => {
                tracing::debug!(node = node_id, "worker client not available for dispatch");
                return;
            }
        };
        if let Err(err) = task.update_version(node_id, &self.meta).await {
            tracing::warn!(error = ?err, task_id = task.task_id(), "error updating task version");
            return;
        }
        if !task.assign_task(&client).await {
            tracing::warn!(task_id = task.task_id(), reason = %task.fail_reason(), "error assigning task to worker");
            return;
        }
        if let Err(err) = task.update_meta_building_state(&self.meta).await {
            tracing::warn!(error = ?err, task_id = task.task_id(), "error recording in-progress state");
            task.set_state(TaskState::Retry, "error recording in-progress state");
            return;
        }
        task.set_started_at(OffsetDateTime::now_utc());
        let queueing = task.started_at() - task.queued_at();
        let queueing_ms = queueing.whole_milliseconds() as f64;
        if queueing > self.config.scheduler_slow_threshold() {
            tracing::warn!(task_id = task.task_id(), queueing_ms, "task queueing time is too long");
        }
        metrics::histogram!(METRIC_TASK_QUEUE_LATENCY_MS, queueing_ms, "kind" => task.kind().as_str());
        tracing::info!(task_id = task.task_id(), node = node_id, "task dispatched to worker");
    }

    /// Execute one polling pass over all running tasks.
    async fn poll_pass(self: &Arc<Self>) {
        let tasks: Vec<Arc<TaskEntry>> = self.running.lock().await.values().cloned().collect();
        if tasks.is_empty() {
            return;
        }
        tracing::debug!(running = tasks.len(), "checking running tasks");

        let mut handles = Vec::new();
        for entry in tasks {
            let permit = match self.poll_semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_closed) => return,
            };
            let inner = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = inner.check_processing(&entry).await;
                match outcome {
                    PollOutcome::Keep => {}
                    PollOutcome::Evict => inner.finalize_running(entry).await,
                    PollOutcome::Requeue => {
                        inner.remove_running(&entry).await;
                        inner.pending.lock().await.push(entry);
                    }
                }
            }));
        }
        for handle in handles {
            let _res = handle.await;
        }
    }

    /// Poll one running task under its key lock.
    async fn check_processing(&self, entry: &Arc<TaskEntry>) -> PollOutcome {
        let mut task = entry.inner.lock().await;
        match task.state() {
            TaskState::InProgress => self.process_in_progress(&mut *task).await,
            TaskState::Retry => self.process_retry(&mut *task).await,
            TaskState::Finished | TaskState::Failed => self.process_finished(&mut *task).await,
            state => {
                tracing::error!(task_id = task.task_id(), ?state, "invalid task state in running map");
                PollOutcome::Keep
            }
        }
    }

    /// Query the task's worker and advance on a terminal result.
    async fn process_in_progress(&self, task: &mut Box<dyn Task>) -> PollOutcome {
        let client = match self.registry.get_client(task.node_id()) {
            Some(client) => client,
            None => {
                tracing::info!(task_id = task.task_id(), node = task.node_id(), "worker lost, task will retry");
                task.set_state(TaskState::Retry, "worker node no longer exists");
                return PollOutcome::Keep;
            }
        };
        task.query_result(&client).await;
        match task.state() {
            TaskState::Finished | TaskState::Failed => self.process_finished(task).await,
            _ => PollOutcome::Keep,
        }
    }

    /// Clean the task off its worker and send it back through the pending queue.
    async fn process_retry(&self, task: &mut Box<dyn Task>) -> PollOutcome {
        if let Some(client) = self.registry.get_client(task.node_id()) {
            if !task.drop_task_on_worker(&client).await {
                return PollOutcome::Keep;
            }
        }
        task.set_state(TaskState::Init, "");
        task.reset_task(&self.meta).await;
        tracing::info!(task_id = task.task_id(), "task reset, returning to pending queue");
        PollOutcome::Requeue
    }

    /// Finalize a terminal task: persist its record, clean its worker, emit latency metrics.
    async fn process_finished(&self, task: &mut Box<dyn Task>) -> PollOutcome {
        if let Err(err) = task.set_job_info(&self.meta).await {
            tracing::warn!(error = ?err, task_id = task.task_id(), "error persisting final task record");
            return PollOutcome::Keep;
        }
        task.set_ended_at(OffsetDateTime::now_utc());
        let running = task.ended_at() - task.started_at();
        let running_ms = running.whole_milliseconds() as f64;
        if running > self.config.scheduler_slow_threshold() {
            tracing::warn!(task_id = task.task_id(), running_ms, "task running time is too long");
        }
        metrics::histogram!(METRIC_TASK_RUN_LATENCY_MS, running_ms, "kind" => task.kind().as_str());
        if let Some(client) = self.registry.get_client(task.node_id()) {
            if !task.drop_task_on_worker(&client).await {
                return PollOutcome::Keep;
            }
        }
        tracing::info!(
            task_id = task.task_id(),
            state = ?task.state(),
            queueing_ms = (task.started_at() - task.queued_at()).whole_milliseconds() as i64,
            running_ms,
            "task has been finalized",
        );
        PollOutcome::Evict
    }

    /// Surface queue & run latency for long-lived tasks.
    async fn collect_task_metrics(&self) {
        let now = OffsetDateTime::now_utc();
        let slow = self.config.scheduler_slow_threshold();
        let mut max_queueing: HashMap<&'static str, f64> = HashMap::new();
        let mut max_running: HashMap<&'static str, f64> = HashMap::new();

        let pending_ids = self.pending.lock().await.task_ids();
        for task_id in &pending_ids {
            let entry = match self.pending.lock().await.get(*task_id) {
                Some(entry) => entry,
                None => continue,
            };
            let task = entry.inner.lock().await;
            if task.state() != TaskState::Init {
                continue;
            }
            let queueing = now - task.queued_at();
            if queueing > slow {
                tracing::warn!(task_id = task.task_id(), queueing_ms = queueing.whole_milliseconds() as i64, "task queueing time is too long");
            }
            let entry = max_queueing.entry(task.kind().as_str()).or_default();
            *entry = entry.max(queueing.whole_milliseconds() as f64);
        }

        let running: Vec<Arc<TaskEntry>> = self.running.lock().await.values().cloned().collect();
        for entry in running {
            let task = entry.inner.lock().await;
            if task.state() != TaskState::InProgress {
                continue;
            }
            let running_time = now - task.started_at();
            if running_time > slow {
                tracing::warn!(task_id = task.task_id(), running_ms = running_time.whole_milliseconds() as i64, "task running time is too long");
            }
            let entry = max_running.entry(task.kind().as_str()).or_default();
            *entry = entry.max(running_time.whole_milliseconds() as f64);
        }

        for (kind, queueing_ms) in max_queueing {
            metrics::histogram!(METRIC_TASK_QUEUE_LATENCY_MS, queueing_ms, "kind" => kind);
        }
        for (kind, running_ms) in max_running {
            metrics::histogram!(METRIC_TASK_RUN_LATENCY_MS, running_ms, "kind" => kind);
        }
        let pending_tasks = self.pending.lock().await.task_count() as f64;
        metrics::gauge!(METRIC_PENDING_TASKS, pending_tasks);
        let running_tasks = self.running.lock().await.len() as f64;
        metrics::gauge!(METRIC_RUNNING_TASKS, running_tasks);
    }

    /// Insert the given task into the running map, tracking per-partition counts.
    async fn insert_running(&self, entry: Arc<TaskEntry>) {
        let newly_inserted = {
            let mut running = self.running.lock().await;
            running.insert(entry.task_id, entry.clone()).is_none()
        };
        if newly_inserted {
            self.pending.lock().await.inc_running(entry.fairness_key);
        }
    }

    /// Remove the given task from the running map, tracking per-partition counts.
    async fn remove_running(&self, entry: &Arc<TaskEntry>) {
        let removed = {
            let mut running = self.running.lock().await;
            running.remove(&entry.task_id).is_some()
        };
        if removed {
            self.pending.lock().await.dec_running(entry.fairness_key);
        }
    }

    /// Evict a finalized task, retaining its snapshot for bounded observability.
    async fn finalize_running(&self, entry: Arc<TaskEntry>) {
        self.remove_running(&entry).await;
        let snapshot = {
            let task = entry.inner.lock().await;
            task.snapshot()
        };
        self.recent.lock().await.insert(snapshot);
    }
}

/// Check if any worker in the snapshot still reports free slots.
fn has_available_slots(slots: &HashMap<i64, WorkerSlots>) -> bool {
    slots.values().any(|ws| ws.available_slots > 0)
}

/// Pick a node for a task of the given slot cost, reserving the cost in the local snapshot.
///
/// First fit wins. When no node has enough room, the node with the most positive slots is taken
/// as a fallback and zeroed, trading a capacity burst for forward progress of oversized tasks.
/// Returns `-1` when no node reports positive slots.
fn pick_node(slots: &mut HashMap<i64, WorkerSlots>, slot_cost: i64) -> i64 {
    let mut fallback_node: i64 = -1;
    let mut max_available: i64 = -1;
    let mut node_ids: Vec<i64> = slots.keys().copied().collect();
    node_ids.sort_unstable();
    for node_id in node_ids {
        let ws = match slots.get_mut(&node_id) {
            Some(ws) => ws,
            None => continue,
        };
        if ws.available_slots >= slot_cost {
            ws.available_slots -= slot_cost;
            return node_id;
        }
        if ws.available_slots > max_available && ws.available_slots > 0 {
            max_available = ws.available_slots;
            fallback_node = node_id;
        }
    }
    if fallback_node != -1 {
        if let Some(ws) = slots.get_mut(&fallback_node) {
            ws.available_slots = 0;
        }
        return fallback_node;
    }
    -1
}

/// A bounded cache of recently finalized task snapshots.
///
/// Retention is best effort and in-memory only: entries expire after the TTL and the oldest
/// entries are evicted beyond the capacity bound.
struct RecentTasks {
    cap: usize,
    ttl: Duration,
    entries: HashMap<i64, (TaskSnapshot, Instant)>,
    order: VecDeque<i64>,
}

impl RecentTasks {
    fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            cap,
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, snapshot: TaskSnapshot) {
        let task_id = snapshot.task_id;
        if self.entries.insert(task_id, (snapshot, Instant::now())).is_some() {
            self.order.retain(|id| *id != task_id);
        }
        self.order.push_back(task_id);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    fn get(&mut self, task_id: i64) -> Option<TaskSnapshot> {
        let (snapshot, inserted_at) = self.entries.get(&task_id)?;
        if inserted_at.elapsed() > self.ttl {
            self.entries.remove(&task_id);
            self.order.retain(|id| *id != task_id);
            return None;
        }
        Some(snapshot.clone())
    }
}
