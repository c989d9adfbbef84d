//! Worker task state machines.
//!
//! Every task kind advances through the same lifecycle, with kind-specific behavior expressed
//! through hook overrides rather than an inheritance hierarchy: a task is a tagged variant over
//! a shared core, and the scheduler only ever speaks to the `Task` trait.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lattice_core::AppError;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::metastore::MetaStore;
use crate::models::{IndexRecord, JobRequest, SegmentState, TaskKind, TaskRecord, TaskState};
use crate::registry::WorkerClient;

/// The fail reason recorded for aborted tasks.
pub const REASON_CANCELED: &str = "canceled";

/// The index type which requires no actual build on a worker.
pub const INDEX_TYPE_FLAT: &str = "FLAT";

const MIB: i64 = 1 << 20;

/// The slot cost of an index build over a payload of the given size.
pub fn calculate_index_task_slot(payload_size: i64) -> i64 {
    if payload_size >= 512 * MIB {
        16
    } else if payload_size >= 256 * MIB {
        8
    } else if payload_size >= 64 * MIB {
        4
    } else {
        2
    }
}

/// The slot cost of a statistics job over a payload of the given size.
pub fn calculate_stats_task_slot(payload_size: i64) -> i64 {
    if payload_size >= 512 * MIB {
        8
    } else if payload_size >= 128 * MIB {
        4
    } else {
        2
    }
}

/// The slot cost of an analyze job. Analyze scans whole collections, so the cost is flat.
pub fn calculate_analyze_task_slot() -> i64 {
    8
}

/// A point-in-time snapshot of a task's externally visible state.
#[derive(Clone, Debug)]
pub struct TaskSnapshot {
    pub task_id: i64,
    pub kind: TaskKind,
    pub state: TaskState,
    pub fail_reason: String,
    pub node_id: i64,
    pub slot_cost: i64,
    pub queued_at: OffsetDateTime,
    pub started_at: OffsetDateTime,
    pub ended_at: OffsetDateTime,
}

/// A schedulable unit tracked by the scheduler.
///
/// The inner mutex is the task's key lock: dispatch and polling both acquire it before touching
/// any task field, which totally orders the task's state transitions.
pub struct TaskEntry {
    /// The unique ID of the task.
    pub task_id: i64,
    /// The task's fair-share partition key.
    pub fairness_key: i64,
    /// The number of worker slots the task consumes.
    pub slot_cost: i64,
    /// The task itself, guarded by its key lock.
    pub inner: Mutex<Box<dyn Task>>,
}

impl TaskEntry {
    /// Create a new instance.
    pub fn new(task: Box<dyn Task>) -> Arc<Self> {
        Arc::new(Self {
            task_id: task.task_id(),
            fairness_key: task.fairness_key(),
            slot_cost: task.slot_cost(),
            inner: Mutex::new(task),
        })
    }
}

/// The shared core state of every task kind.
pub struct TaskCore {
    /// The task's persisted record.
    pub record: TaskRecord,
    /// The job request submitted to workers.
    pub req: JobRequest,
    /// The number of worker slots the task consumes.
    pub slot_cost: i64,
    /// The time the task entered the pending queue.
    pub queued_at: OffsetDateTime,
    /// The time the task was dispatched to its worker.
    pub started_at: OffsetDateTime,
    /// The time the task was finalized.
    pub ended_at: OffsetDateTime,
}

impl TaskCore {
    fn new(record: TaskRecord, cluster: &str, slot_cost: i64) -> Self {
        let req = JobRequest {
            cluster_id: cluster.to_string(),
            task_id: record.task_id,
            kind: record.kind,
            collection_id: record.collection_id,
            segment_id: record.segment_id,
            payload_size: record.payload_size,
            slot_cost,
        };
        let now = OffsetDateTime::now_utc();
        Self {
            record,
            req,
            slot_cost,
            queued_at: now,
            started_at: now,
            ended_at: now,
        }
    }

    fn set_state(&mut self, state: TaskState, reason: &str) {
        self.record.state = state as i32;
        self.record.fail_reason = reason.to_string();
    }
}

/// A unit of asynchronous work dispatched to a worker node.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// The shared core of this task.
    fn core(&self) -> &TaskCore;

    /// The shared core of this task.
    fn core_mut(&mut self) -> &mut TaskCore;

    /// The kind of this task.
    fn kind(&self) -> TaskKind;

    fn task_id(&self) -> i64 {
        self.core().record.task_id
    }

    fn fairness_key(&self) -> i64 {
        self.core().record.collection_id
    }

    fn slot_cost(&self) -> i64 {
        self.core().slot_cost
    }

    fn node_id(&self) -> i64 {
        self.core().record.node_id
    }

    fn state(&self) -> TaskState {
        self.core().record.task_state()
    }

    fn fail_reason(&self) -> String {
        self.core().record.fail_reason.clone()
    }

    fn set_state(&mut self, state: TaskState, reason: &str) {
        self.core_mut().set_state(state, reason);
    }

    fn queued_at(&self) -> OffsetDateTime {
        self.core().queued_at
    }

    fn set_queued_at(&mut self, at: OffsetDateTime) {
        self.core_mut().queued_at = at;
    }

    fn started_at(&self) -> OffsetDateTime {
        self.core().started_at
    }

    fn set_started_at(&mut self, at: OffsetDateTime) {
        self.core_mut().started_at = at;
    }

    fn ended_at(&self) -> OffsetDateTime {
        self.core().ended_at
    }

    fn set_ended_at(&mut self, at: OffsetDateTime) {
        self.core_mut().ended_at = at;
    }

    /// A point-in-time snapshot of this task's externally visible state.
    fn snapshot(&self) -> TaskSnapshot {
        let core = self.core();
        TaskSnapshot {
            task_id: core.record.task_id,
            kind: self.kind(),
            state: core.record.task_state(),
            fail_reason: core.record.fail_reason.clone(),
            node_id: core.record.node_id,
            slot_cost: core.slot_cost,
            queued_at: core.queued_at,
            started_at: core.started_at,
            ended_at: core.ended_at,
        }
    }

    /// Check whether this task truly needs to run.
    ///
    /// Returning false indicates there is nothing to do; the hook records the task's terminal
    /// state before returning and the scheduler finalizes it without touching a worker.
    async fn pre_check(&mut self, _meta: &MetaStore) -> bool {
        true
    }

    /// Record a new attempt version ahead of dispatch.
    async fn update_version(&mut self, node_id: i64, meta: &MetaStore) -> Result<()> {
        let core = self.core_mut();
        core.record.version += 1;
        core.record.node_id = node_id;
        meta.put_task_record(&core.record).await
    }

    /// Submit the task's job to the target worker.
    ///
    /// On failure the fail reason is recorded and the task is left in-progress, to be picked up
    /// and resolved by the polling loop.
    async fn assign_task(&mut self, client: &Arc<dyn WorkerClient>) -> bool {
        let core = self.core_mut();
        match client.create_job(core.req.clone()).await {
            Ok(()) => true,
            Err(err) => {
                core.record.state = TaskState::InProgress as i32;
                core.record.fail_reason = format!("error submitting job to worker: {:#}", err);
                false
            }
        }
    }

    /// Record the in-progress state in the metadata store.
    async fn update_meta_building_state(&mut self, meta: &MetaStore) -> Result<()> {
        let core = self.core_mut();
        core.record.state = TaskState::InProgress as i32;
        meta.put_task_record(&core.record).await
    }

    /// Query the worker for the job's current result.
    async fn query_result(&mut self, client: &Arc<dyn WorkerClient>) {
        let task_id = self.task_id();
        let core = self.core_mut();
        match client.query_job(task_id).await {
            Ok(status) => match status.task_state() {
                TaskState::Finished => {
                    core.record.output_files = status.output_files;
                    core.set_state(TaskState::Finished, "");
                }
                TaskState::Failed => core.set_state(TaskState::Failed, &status.fail_reason),
                TaskState::Retry => core.set_state(TaskState::Retry, &status.fail_reason),
                TaskState::InProgress | TaskState::Init | TaskState::None => {}
            },
            Err(err) => core.set_state(TaskState::Retry, &format!("error querying job on worker: {:#}", err)),
        }
    }

    /// Drop the task's job from the target worker, best effort.
    async fn drop_task_on_worker(&self, client: &Arc<dyn WorkerClient>) -> bool {
        match client.drop_job(self.task_id()).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = ?err, task_id = self.task_id(), "error dropping job on worker");
                false
            }
        }
    }

    /// Clear the artifacts of a failed attempt ahead of re-entering the pending queue.
    async fn reset_task(&mut self, meta: &MetaStore) {
        let core = self.core_mut();
        core.record.node_id = -1;
        core.record.output_files.clear();
        if let Err(err) = meta.put_task_record(&core.record).await {
            tracing::warn!(error = ?err, task_id = core.record.task_id, "error persisting task reset");
        }
    }

    /// Persist the task's final record.
    async fn set_job_info(&self, meta: &MetaStore) -> Result<()> {
        meta.put_task_record(&self.core().record).await
    }

    /// Purge the task's metadata.
    async fn drop_task_meta(&self, meta: &MetaStore) -> Result<()> {
        meta.drop_task_record(self.kind(), self.task_id()).await
    }
}

/// Build a task of the appropriate kind from the given record.
pub fn task_from_record(mut record: TaskRecord, cluster: &str) -> Result<Box<dyn Task>> {
    if record.task_id <= 0 {
        return Err(AppError::InvalidInput(format!("invalid task ID {}", record.task_id)).into());
    }
    // The proto default of 0 means the record has never been assigned.
    if record.node_id == 0 {
        record.node_id = -1;
    }
    match TaskKind::from_i32(record.kind) {
        Some(TaskKind::IndexBuild) => Ok(Box::new(IndexBuildTask::new(record, cluster))),
        Some(TaskKind::Analyze) => Ok(Box::new(AnalyzeTask::new(record, cluster))),
        Some(TaskKind::Stats) => Ok(Box::new(StatsTask::new(record, cluster))),
        None => Err(AppError::InvalidInput(format!("unknown task kind {}", record.kind)).into()),
    }
}

/// A vector index build task.
pub struct IndexBuildTask {
    core: TaskCore,
}

impl IndexBuildTask {
    pub fn new(record: TaskRecord, cluster: &str) -> Self {
        let slot_cost = calculate_index_task_slot(record.payload_size);
        Self {
            core: TaskCore::new(record, cluster, slot_cost),
        }
    }
}

#[async_trait]
impl Task for IndexBuildTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn kind(&self) -> TaskKind {
        TaskKind::IndexBuild
    }

    /// A flat index needs no build; finalize immediately as finished.
    async fn pre_check(&mut self, _meta: &MetaStore) -> bool {
        if self.core.record.index_type == INDEX_TYPE_FLAT {
            self.core.set_state(TaskState::Finished, "");
            return false;
        }
        true
    }

    /// Persist the final record, and on success record the built index so downstream readers
    /// and the garbage collector can see the segment as indexed.
    async fn set_job_info(&self, meta: &MetaStore) -> Result<()> {
        meta.put_task_record(&self.core.record).await?;
        if self.core.record.task_state() == TaskState::Finished {
            let index = IndexRecord {
                build_id: self.core.record.task_id,
                segment_id: self.core.record.segment_id,
                collection_id: self.core.record.collection_id,
                state: self.core.record.state,
                index_version: self.core.record.version,
                file_keys: self.core.record.output_files.clone(),
                dropped: false,
            };
            meta.put_index(&index).await?;
        }
        Ok(())
    }
}

/// A data distribution analyze task.
pub struct AnalyzeTask {
    core: TaskCore,
}

impl AnalyzeTask {
    pub fn new(record: TaskRecord, cluster: &str) -> Self {
        let slot_cost = calculate_analyze_task_slot();
        Self {
            core: TaskCore::new(record, cluster, slot_cost),
        }
    }
}

#[async_trait]
impl Task for AnalyzeTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Analyze
    }
}

/// A statistics computation task.
pub struct StatsTask {
    core: TaskCore,
}

impl StatsTask {
    pub fn new(record: TaskRecord, cluster: &str) -> Self {
        let slot_cost = calculate_stats_task_slot(record.payload_size);
        Self {
            core: TaskCore::new(record, cluster, slot_cost),
        }
    }
}

#[async_trait]
impl Task for StatsTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Stats
    }

    /// Stats over a dropped or vanished segment can never complete; fail fast instead of
    /// burning a worker slot.
    async fn pre_check(&mut self, meta: &MetaStore) -> bool {
        match meta.get_segment(self.core.record.segment_id).await {
            Ok(Some(segment)) if segment.segment_state() != SegmentState::Dropped => true,
            Ok(_) => {
                self.core.set_state(TaskState::Failed, "segment no longer exists or was dropped");
                false
            }
            Err(err) => {
                tracing::warn!(error = ?err, task_id = self.core.record.task_id, "error checking segment ahead of stats dispatch");
                self.core.set_state(TaskState::Retry, "error checking segment state");
                false
            }
        }
    }
}
