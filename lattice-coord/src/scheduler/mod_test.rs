use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::database::Database;
use crate::fixtures::{self, ScriptedWorker};
use crate::metastore::MetaStore;
use crate::models::{SegmentState, TaskKind, TaskState};
use crate::registry::{SessionEvent, WorkerSlots};
use crate::scheduler::task::{task_from_record, REASON_CANCELED};
use crate::scheduler::{pick_node, SchedulerRunner, TaskScheduler};

struct TestHarness {
    scheduler: TaskScheduler,
    _runner: SchedulerRunner,
    meta: MetaStore,
    events_tx: tokio::sync::mpsc::Sender<SessionEvent>,
    shutdown_tx: broadcast::Sender<()>,
    _tmpdir: tempfile::TempDir,
}

async fn harness(workers: Vec<(i64, Arc<ScriptedWorker>)>) -> Result<TestHarness> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let meta = MetaStore::new(&db).await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let (registry, events_tx) = fixtures::spawn_registry(workers, &shutdown_tx).await?;
    let (scheduler, runner) = TaskScheduler::new(config, meta.clone(), registry, shutdown_tx.clone()).await?;
    Ok(TestHarness {
        scheduler,
        _runner: runner,
        meta,
        events_tx,
        shutdown_tx,
        _tmpdir: tmpdir,
    })
}

#[tokio::test]
async fn dispatch_places_task_on_worker_with_capacity() -> Result<()> {
    let worker = Arc::new(ScriptedWorker::new(16));
    let h = harness(vec![(1, worker.clone())]).await?;

    let record = fixtures::index_task_record(7, 100, 1000, 1 << 20);
    h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    assert!(h.scheduler.exists(7).await, "expected task 7 to be tracked after enqueue");

    h.scheduler.inner.dispatch_pass().await;

    // The task must be running, off the pending queue, and on the worker.
    assert!(worker.has_job(7), "expected the job to be created on the worker");
    let pending = h.scheduler.inner.pending.lock().await.contains(7);
    assert!(!pending, "expected task 7 to have left the pending queue");
    let running = h.scheduler.inner.running.lock().await.contains_key(&7);
    assert!(running, "expected task 7 to be in the running map");

    let persisted = h
        .meta
        .get_task_record(TaskKind::IndexBuild, 7)
        .await?
        .expect("expected a persisted task record");
    assert_eq!(persisted.task_state(), TaskState::InProgress, "expected the persisted state to be in-progress");
    assert_eq!(persisted.node_id, 1, "expected the task to be assigned to node 1");
    assert_eq!(persisted.version, 1, "expected one attempt version, got {}", persisted.version);

    Ok(())
}

#[tokio::test]
async fn finished_task_is_finalized_and_observable() -> Result<()> {
    let worker = Arc::new(ScriptedWorker::new(16));
    let h = harness(vec![(1, worker.clone())]).await?;

    let record = fixtures::index_task_record(8, 100, 1000, 1 << 20);
    h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    h.scheduler.inner.dispatch_pass().await;

    worker.complete_job(8, TaskState::Finished, "", vec!["files/8/index".into()]);
    h.scheduler.inner.poll_pass().await;

    assert!(!h.scheduler.exists(8).await, "expected task 8 to be evicted after finalization");
    assert!(!worker.has_job(8), "expected the job to be dropped from the worker");
    let persisted = h
        .meta
        .get_task_record(TaskKind::IndexBuild, 8)
        .await?
        .expect("expected a persisted task record");
    assert_eq!(persisted.task_state(), TaskState::Finished, "expected the final state to be finished");
    assert_eq!(persisted.output_files, vec!["files/8/index".to_string()], "expected output files recorded");

    // A finished index build registers the built index.
    let index = h.meta.get_index(8).await?.expect("expected an index record to be written");
    assert_eq!(index.segment_id, 1000, "expected the index to reference its segment");
    assert_eq!(index.index_state(), TaskState::Finished, "expected the index to be finished");

    // The snapshot outlives eviction via the recent-task cache.
    let stats = h.scheduler.task_stats(8).await.expect("expected task stats after eviction");
    assert_eq!(stats.state, TaskState::Finished, "expected finished stats, got {:?}", stats.state);

    Ok(())
}

#[tokio::test]
async fn flat_index_skips_the_worker_entirely() -> Result<()> {
    let worker = Arc::new(ScriptedWorker::new(16));
    let h = harness(vec![(1, worker.clone())]).await?;

    let mut record = fixtures::index_task_record(9, 100, 1000, 1 << 20);
    record.index_type = crate::scheduler::task::INDEX_TYPE_FLAT.into();
    h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    h.scheduler.inner.dispatch_pass().await;

    assert!(!worker.has_job(9), "expected no worker job for a flat index");
    h.scheduler.inner.poll_pass().await;
    assert!(!h.scheduler.exists(9).await, "expected the flat index task to be finalized");
    let stats = h.scheduler.task_stats(9).await.expect("expected task stats after finalization");
    assert_eq!(stats.state, TaskState::Finished, "expected the flat index task to finish, got {:?}", stats.state);

    Ok(())
}

#[tokio::test]
async fn stats_over_dropped_or_missing_segment_fails_fast() -> Result<()> {
    let worker = Arc::new(ScriptedWorker::new(16));
    let h = harness(vec![(1, worker.clone())]).await?;

    // Segment 2000 was dropped after its stats task was queued; segment 3000 never existed.
    h.meta
        .put_segment(&fixtures::segment_record(2000, 100, "wal-0", SegmentState::Dropped))
        .await?;
    let dropped = fixtures::stats_task_record(91, 100, 2000, 1 << 20);
    h.scheduler.enqueue(task_from_record(dropped, "testing")?).await?;
    let missing = fixtures::stats_task_record(92, 100, 3000, 1 << 20);
    h.scheduler.enqueue(task_from_record(missing, "testing")?).await?;

    h.scheduler.inner.dispatch_pass().await;

    // Neither task may burn a worker slot; both fail during the pre-dispatch check.
    assert_eq!(worker.job_count(), 0, "expected no worker jobs for doomed stats tasks, got {}", worker.job_count());
    for task_id in [91i64, 92] {
        let entry = {
            let running = h.scheduler.inner.running.lock().await;
            running.get(&task_id).expect("expected the failed task in the running map").clone()
        };
        let task = entry.inner.lock().await;
        assert_eq!(task.state(), TaskState::Failed, "expected task {} to fail fast, got {:?}", task_id, task.state());
        assert_eq!(
            task.fail_reason(),
            "segment no longer exists or was dropped",
            "expected the segment fail reason on task {}, got {}",
            task_id,
            task.fail_reason()
        );
    }

    // One polling pass later both are finalized, persisted, and evicted.
    h.scheduler.inner.poll_pass().await;
    for task_id in [91i64, 92] {
        assert!(!h.scheduler.exists(task_id).await, "expected task {} to be finalized and evicted", task_id);
        let persisted = h
            .meta
            .get_task_record(TaskKind::Stats, task_id)
            .await?
            .expect("expected a persisted final record");
        assert_eq!(persisted.task_state(), TaskState::Failed, "expected the persisted state of task {} to be failed", task_id);
    }

    Ok(())
}

#[tokio::test]
async fn zero_workers_leaves_tasks_pending() -> Result<()> {
    let h = harness(vec![]).await?;

    let record = fixtures::analyze_task_record(10, 100);
    h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    h.scheduler.inner.dispatch_pass().await;

    let pending = h.scheduler.inner.pending.lock().await.contains(10);
    assert!(pending, "expected the task to remain pending without workers");
    let running = h.scheduler.inner.running.lock().await.is_empty();
    assert!(running, "expected the running map to stay empty without workers");

    Ok(())
}

#[tokio::test]
async fn worker_loss_sends_running_task_back_to_pending() -> Result<()> {
    let worker = Arc::new(ScriptedWorker::new(16));
    let h = harness(vec![(1, worker.clone())]).await?;

    let record = fixtures::index_task_record(11, 100, 1000, 4 << 20);
    h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    h.scheduler.inner.dispatch_pass().await;
    assert!(h.scheduler.inner.running.lock().await.contains_key(&11), "expected task 11 to be running");

    // The worker's lease expires.
    h.events_tx
        .send(SessionEvent::NodeLeave { node_id: 1 })
        .await
        .context("error sending leave event")?;
    let mut membership = h.scheduler.inner.registry.membership();
    while !membership.borrow().is_empty() {
        membership.changed().await.context("membership channel closed")?;
    }

    // First poll observes the lost worker; the second cleans up and requeues.
    h.scheduler.inner.poll_pass().await;
    {
        let running = h.scheduler.inner.running.lock().await;
        let entry = running.get(&11).expect("expected task 11 still tracked");
        let task = entry.inner.lock().await;
        assert_eq!(task.state(), TaskState::Retry, "expected the task to be marked retry, got {:?}", task.state());
    }
    h.scheduler.inner.poll_pass().await;
    let pending = h.scheduler.inner.pending.lock().await.contains(11);
    assert!(pending, "expected task 11 re-enqueued after the retry reset");

    // With no workers left, dispatch keeps the task pending without error.
    h.scheduler.inner.dispatch_pass().await;
    let pending = h.scheduler.inner.pending.lock().await.contains(11);
    assert!(pending, "expected task 11 to stay pending without workers");

    let _res = h.shutdown_tx.send(());
    Ok(())
}

#[tokio::test]
async fn abort_pending_task_finalizes_as_canceled() -> Result<()> {
    let h = harness(vec![]).await?;

    let record = fixtures::stats_task_record(12, 100, 1000, 1 << 20);
    h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    h.scheduler.abort(12).await;

    let pending = h.scheduler.inner.pending.lock().await.contains(12);
    assert!(!pending, "expected the aborted task to leave the pending queue");
    {
        let running = h.scheduler.inner.running.lock().await;
        let entry = running.get(&12).expect("expected the aborted task in the running map");
        let task = entry.inner.lock().await;
        assert_eq!(task.state(), TaskState::Failed, "expected the aborted task to be failed");
        assert_eq!(task.fail_reason(), REASON_CANCELED, "expected the cancel reason, got {}", task.fail_reason());
    }

    // One polling pass later the task is finalized and evicted.
    h.scheduler.inner.poll_pass().await;
    assert!(!h.scheduler.exists(12).await, "expected the aborted task to be evicted");
    let stats = h.scheduler.task_stats(12).await.expect("expected task stats after eviction");
    assert_eq!(stats.state, TaskState::Failed, "expected failed stats, got {:?}", stats.state);
    assert_eq!(stats.fail_reason, REASON_CANCELED, "expected the cancel reason in stats");
    let persisted = h
        .meta
        .get_task_record(TaskKind::Stats, 12)
        .await?
        .expect("expected a persisted final record");
    assert_eq!(persisted.task_state(), TaskState::Failed, "expected the persisted state to be failed");

    Ok(())
}

#[tokio::test]
async fn abort_running_task_finalizes_within_one_poll() -> Result<()> {
    let worker = Arc::new(ScriptedWorker::new(16));
    let h = harness(vec![(1, worker.clone())]).await?;

    let record = fixtures::index_task_record(13, 100, 1000, 1 << 20);
    h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    h.scheduler.inner.dispatch_pass().await;
    h.scheduler.abort(13).await;

    h.scheduler.inner.poll_pass().await;
    assert!(!h.scheduler.exists(13).await, "expected the aborted running task to be evicted");
    assert!(!worker.has_job(13), "expected the job to be dropped from the worker");
    let stats = h.scheduler.task_stats(13).await.expect("expected task stats after eviction");
    assert_eq!(stats.state, TaskState::Failed, "expected failed stats, got {:?}", stats.state);
    assert_eq!(stats.fail_reason, REASON_CANCELED, "expected the cancel reason in stats");

    Ok(())
}

#[tokio::test]
async fn slot_accounting_bounds_dispatch_within_a_pass() -> Result<()> {
    // One worker with room for exactly two small tasks.
    let worker = Arc::new(ScriptedWorker::new(4));
    let h = harness(vec![(1, worker.clone())]).await?;

    for task_id in [21, 22, 23] {
        let record = fixtures::index_task_record(task_id, 100, 1000 + task_id, 1 << 20);
        h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    }
    h.scheduler.inner.dispatch_pass().await;

    // Slot cost is 2 per small task: two fit, the third waits.
    assert_eq!(worker.job_count(), 2, "expected exactly two jobs dispatched, got {}", worker.job_count());
    let pending = h.scheduler.inner.pending.lock().await.task_count();
    assert_eq!(pending, 1, "expected one task left pending, got {}", pending);

    Ok(())
}

#[tokio::test]
async fn oversized_task_uses_the_fallback_node() -> Result<()> {
    // No worker can hold a 16-slot build, but the max-positive node absorbs it.
    let worker = Arc::new(ScriptedWorker::new(4));
    let h = harness(vec![(1, worker.clone())]).await?;

    let record = fixtures::index_task_record(31, 100, 1000, 1 << 30);
    h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    h.scheduler.inner.dispatch_pass().await;

    assert!(worker.has_job(31), "expected the oversized task to be dispatched to the fallback node");
    assert!(h.scheduler.inner.running.lock().await.contains_key(&31), "expected the oversized task to be running");

    Ok(())
}

#[tokio::test]
async fn enqueue_is_a_noop_for_running_tasks() -> Result<()> {
    let worker = Arc::new(ScriptedWorker::new(16));
    let h = harness(vec![(1, worker.clone())]).await?;

    let record = fixtures::index_task_record(41, 100, 1000, 1 << 20);
    h.scheduler.enqueue(task_from_record(record.clone(), "testing")?).await?;
    h.scheduler.inner.dispatch_pass().await;

    h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    let pending = h.scheduler.inner.pending.lock().await.contains(41);
    assert!(!pending, "expected a running task to not be re-queued");

    Ok(())
}

#[tokio::test]
async fn tasks_are_tracked_in_pending_xor_running() -> Result<()> {
    let worker = Arc::new(ScriptedWorker::new(16));
    let h = harness(vec![(1, worker.clone())]).await?;

    let record = fixtures::index_task_record(51, 100, 1000, 1 << 20);
    h.scheduler.enqueue(task_from_record(record, "testing")?).await?;
    {
        let pending = h.scheduler.inner.pending.lock().await.contains(51);
        let running = h.scheduler.inner.running.lock().await.contains_key(&51);
        assert!(pending && !running, "expected pending XOR running before dispatch");
    }
    h.scheduler.inner.dispatch_pass().await;
    {
        let pending = h.scheduler.inner.pending.lock().await.contains(51);
        let running = h.scheduler.inner.running.lock().await.contains_key(&51);
        assert!(!pending && running, "expected pending XOR running after dispatch");
    }
    Ok(())
}

#[tokio::test]
async fn reload_rebuilds_pending_and_running_from_meta() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let meta = MetaStore::new(&db).await?;

    let mut init = fixtures::index_task_record(61, 100, 1000, 1 << 20);
    init.state = TaskState::Init as i32;
    meta.put_task_record(&init).await?;
    let mut in_progress = fixtures::stats_task_record(62, 100, 2000, 1 << 20);
    in_progress.state = TaskState::InProgress as i32;
    in_progress.node_id = 1;
    meta.put_task_record(&in_progress).await?;
    let mut finished = fixtures::analyze_task_record(63, 100);
    finished.state = TaskState::Finished as i32;
    meta.put_task_record(&finished).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let (registry, _events_tx) = fixtures::spawn_registry(vec![], &shutdown_tx).await?;
    let (scheduler, _runner) = TaskScheduler::new(config, meta, registry, shutdown_tx).await?;

    let pending = scheduler.inner.pending.lock().await.contains(61);
    assert!(pending, "expected the init task to be recovered into the pending queue");
    let running = scheduler.inner.running.lock().await.contains_key(&62);
    assert!(running, "expected the in-progress task to be recovered into the running map");
    assert!(!scheduler.exists(63).await, "expected the finished task to not be recovered");

    Ok(())
}

#[test]
fn pick_node_first_fit_reserves_slots() {
    let mut slots = HashMap::new();
    slots.insert(1, WorkerSlots { node_id: 1, available_slots: 4 });
    slots.insert(2, WorkerSlots { node_id: 2, available_slots: 8 });

    let node = pick_node(&mut slots, 4);
    assert_eq!(node, 1, "expected first fit on node 1, got {}", node);
    assert_eq!(slots[&1].available_slots, 0, "expected node 1 slots to be reserved");

    let node = pick_node(&mut slots, 4);
    assert_eq!(node, 2, "expected node 2 once node 1 is exhausted, got {}", node);
    assert_eq!(slots[&2].available_slots, 4, "expected node 2 slots to be reserved");
}

#[test]
fn pick_node_falls_back_to_max_positive_node() {
    let mut slots = HashMap::new();
    slots.insert(1, WorkerSlots { node_id: 1, available_slots: 2 });
    slots.insert(2, WorkerSlots { node_id: 2, available_slots: 6 });

    let node = pick_node(&mut slots, 16);
    assert_eq!(node, 2, "expected the max-positive fallback node, got {}", node);
    assert_eq!(slots[&2].available_slots, 0, "expected the fallback node to be zeroed");

    // A second oversized pick has no positive node left besides node 1.
    let node = pick_node(&mut slots, 16);
    assert_eq!(node, 1, "expected the remaining positive node as fallback, got {}", node);

    let node = pick_node(&mut slots, 16);
    assert_eq!(node, -1, "expected -1 once no node reports positive slots, got {}", node);
}

#[test]
fn pick_node_returns_minus_one_without_workers() {
    let mut slots = HashMap::new();
    let node = pick_node(&mut slots, 2);
    assert_eq!(node, -1, "expected -1 without workers, got {}", node);
}
