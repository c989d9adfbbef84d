//! Shared test fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::models::{JobRequest, JobStatus, SegmentRecord, SegmentState, TaskKind, TaskRecord, TaskState};
use crate::registry::{SessionEvent, SessionWatcher, WorkerClient, WorkerRegistry};

/// A scripted in-memory worker used to exercise the registry & scheduler.
pub struct ScriptedWorker {
    slots: AtomicI64,
    refuse_jobs: AtomicBool,
    jobs: Mutex<HashMap<i64, JobStatus>>,
}

impl ScriptedWorker {
    /// Create a new instance reporting the given slot capacity.
    pub fn new(slots: i64) -> Self {
        Self {
            slots: AtomicI64::new(slots),
            refuse_jobs: AtomicBool::new(false),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_slots(&self, slots: i64) {
        self.slots.store(slots, Ordering::SeqCst);
    }

    pub fn set_refuse_jobs(&self, refuse: bool) {
        self.refuse_jobs.store(refuse, Ordering::SeqCst);
    }

    /// Script the worker to report the given terminal state for a held job.
    pub fn complete_job(&self, task_id: i64, state: TaskState, fail_reason: &str, output_files: Vec<String>) {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.insert(
            task_id,
            JobStatus {
                task_id,
                state: state as i32,
                fail_reason: fail_reason.to_string(),
                output_files,
            },
        );
    }

    pub fn has_job(&self, task_id: i64) -> bool {
        self.jobs.lock().unwrap().contains_key(&task_id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkerClient for ScriptedWorker {
    async fn query_slots(&self) -> Result<i64> {
        Ok(self.slots.load(Ordering::SeqCst))
    }

    async fn create_job(&self, req: JobRequest) -> Result<()> {
        if self.refuse_jobs.load(Ordering::SeqCst) {
            bail!("worker is refusing jobs");
        }
        let mut jobs = self.jobs.lock().unwrap();
        jobs.insert(
            req.task_id,
            JobStatus {
                task_id: req.task_id,
                state: TaskState::InProgress as i32,
                fail_reason: "".into(),
                output_files: vec![],
            },
        );
        Ok(())
    }

    async fn query_job(&self, task_id: i64) -> Result<JobStatus> {
        let jobs = self.jobs.lock().unwrap();
        match jobs.get(&task_id) {
            Some(status) => Ok(status.clone()),
            None => bail!("unknown job {}", task_id),
        }
    }

    async fn drop_job(&self, task_id: i64) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.remove(&task_id);
        Ok(())
    }
}

/// Spawn a session watcher and register the given workers, awaiting full membership.
pub async fn spawn_registry(
    workers: Vec<(i64, Arc<ScriptedWorker>)>, shutdown_tx: &broadcast::Sender<()>,
) -> Result<(WorkerRegistry, mpsc::Sender<SessionEvent>)> {
    let expected = workers.len();
    let (events_tx, events_rx) = mpsc::channel(16);
    let (watcher, registry) = SessionWatcher::new(events_rx, shutdown_tx.subscribe());
    let _handle = watcher.spawn();
    for (node_id, worker) in workers {
        events_tx
            .send(SessionEvent::NodeJoin {
                node_id,
                endpoint: format!("worker-{}:7100", node_id),
                client: worker,
            })
            .await
            .context("error sending join event")?;
    }
    let mut membership = registry.membership();
    while membership.borrow().len() < expected {
        membership.changed().await.context("membership channel closed")?;
    }
    Ok((registry, events_tx))
}

/// Build an index build task record in the init state.
pub fn index_task_record(task_id: i64, collection_id: i64, segment_id: i64, payload_size: i64) -> TaskRecord {
    TaskRecord {
        task_id,
        kind: TaskKind::IndexBuild as i32,
        state: TaskState::Init as i32,
        node_id: -1,
        collection_id,
        segment_id,
        payload_size,
        index_type: "HNSW".into(),
        ..Default::default()
    }
}

/// Build a stats task record in the init state.
pub fn stats_task_record(task_id: i64, collection_id: i64, segment_id: i64, payload_size: i64) -> TaskRecord {
    TaskRecord {
        task_id,
        kind: TaskKind::Stats as i32,
        state: TaskState::Init as i32,
        node_id: -1,
        collection_id,
        segment_id,
        payload_size,
        target_segment_id: segment_id + 1,
        ..Default::default()
    }
}

/// Build an analyze task record in the init state.
pub fn analyze_task_record(task_id: i64, collection_id: i64) -> TaskRecord {
    TaskRecord {
        task_id,
        kind: TaskKind::Analyze as i32,
        state: TaskState::Init as i32,
        node_id: -1,
        collection_id,
        ..Default::default()
    }
}

/// Build a segment record riding the given channel.
pub fn segment_record(segment_id: i64, collection_id: i64, channel: &str, state: SegmentState) -> SegmentRecord {
    SegmentRecord {
        segment_id,
        collection_id,
        channel: channel.to_string(),
        state: state as i32,
        size_bytes: 1 << 20,
        ..Default::default()
    }
}
