use anyhow::Result;

use crate::config::Config;
use crate::database::Database;
use crate::metastore::MetaStore;
use crate::models::{ChannelState, PChannelMeta, SegmentRecord, SegmentState, TaskKind, TaskRecord, TaskState};

async fn new_store() -> Result<(MetaStore, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    Ok((MetaStore::new(&db).await?, tmpdir))
}

#[tokio::test]
async fn pchannel_round_trip_and_list() -> Result<()> {
    let (store, _tmpdir) = new_store().await?;

    let mut meta = PChannelMeta {
        name: "wal-0".into(),
        term: 1,
        node_id: 3,
        vchannel_count: 2,
        ..Default::default()
    };
    meta.state = ChannelState::Assigning as i32;
    store.put_pchannel(&meta).await?;

    let fetched = store
        .get_pchannel("wal-0")
        .await?
        .expect("expected channel record to be persisted");
    assert_eq!(fetched, meta, "expected fetched channel meta to match persisted meta");

    // A second put under the same key must be an idempotent overwrite.
    store.put_pchannel(&meta).await?;
    let all = store.list_pchannels().await?;
    assert_eq!(all.len(), 1, "expected exactly one channel record, got {}", all.len());

    Ok(())
}

#[tokio::test]
async fn streaming_version_flag_round_trip() -> Result<()> {
    let (store, _tmpdir) = new_store().await?;

    let initial = store.get_streaming_version().await?;
    assert!(initial.is_none(), "expected no streaming version initially, got {:?}", initial);

    store.put_streaming_version(1).await?;
    let version = store.get_streaming_version().await?;
    assert_eq!(version, Some(1), "expected streaming version 1, got {:?}", version);

    Ok(())
}

#[tokio::test]
async fn task_records_are_scoped_by_kind() -> Result<()> {
    let (store, _tmpdir) = new_store().await?;

    let index_task = TaskRecord {
        task_id: 1,
        kind: TaskKind::IndexBuild as i32,
        state: TaskState::Init as i32,
        collection_id: 10,
        ..Default::default()
    };
    let stats_task = TaskRecord {
        task_id: 2,
        kind: TaskKind::Stats as i32,
        state: TaskState::InProgress as i32,
        collection_id: 10,
        ..Default::default()
    };
    store.put_task_record(&index_task).await?;
    store.put_task_record(&stats_task).await?;

    let index_tasks = store.list_tasks(TaskKind::IndexBuild).await?;
    assert_eq!(index_tasks.len(), 1, "expected one index task, got {}", index_tasks.len());
    assert_eq!(index_tasks[0], index_task, "expected listed index task to match persisted record");

    let analyze_tasks = store.list_tasks(TaskKind::Analyze).await?;
    assert!(analyze_tasks.is_empty(), "expected no analyze tasks, got {}", analyze_tasks.len());

    store.drop_task_record(TaskKind::IndexBuild, 1).await?;
    let record = store.get_task_record(TaskKind::IndexBuild, 1).await?;
    assert!(record.is_none(), "expected index task record to be dropped, got {:?}", record);
    // Dropping an already dropped record is a no-op.
    store.drop_task_record(TaskKind::IndexBuild, 1).await?;

    Ok(())
}

#[tokio::test]
async fn segments_by_channel_filters_records() -> Result<()> {
    use rand::prelude::*;

    let (store, _tmpdir) = new_store().await?;

    let wal0_count = rand::thread_rng().gen_range(2..8);
    for id in 1..=wal0_count {
        let mut seg = SegmentRecord {
            segment_id: id,
            collection_id: 100,
            channel: "wal-0".into(),
            ..Default::default()
        };
        seg.state = SegmentState::Flushed as i32;
        store.put_segment(&seg).await?;
    }
    let mut other = SegmentRecord {
        segment_id: wal0_count + 1,
        collection_id: 100,
        channel: "wal-1".into(),
        ..Default::default()
    };
    other.state = SegmentState::Flushed as i32;
    store.put_segment(&other).await?;

    let wal0 = store.segments_by_channel("wal-0").await?;
    assert_eq!(wal0.len() as i64, wal0_count, "expected {} segments on wal-0, got {}", wal0_count, wal0.len());
    let wal1 = store.segments_by_channel("wal-1").await?;
    assert_eq!(wal1.len(), 1, "expected one segment on wal-1, got {}", wal1.len());

    store.drop_segment(1).await?;
    let seg = store.get_segment(1).await?;
    assert!(seg.is_none(), "expected segment 1 to be dropped, got {:?}", seg);

    Ok(())
}

#[tokio::test]
async fn channel_checkpoint_round_trip() -> Result<()> {
    let (store, _tmpdir) = new_store().await?;

    store.save_channel_checkpoint("wal-0", 1_000).await?;
    let cp = store
        .get_channel_checkpoint("wal-0")
        .await?
        .expect("expected checkpoint to be persisted");
    assert_eq!(cp.timestamp, 1_000, "expected checkpoint timestamp 1000, got {}", cp.timestamp);

    // Overwrites advance the checkpoint in place.
    store.save_channel_checkpoint("wal-0", 2_000).await?;
    let cp = store
        .get_channel_checkpoint("wal-0")
        .await?
        .expect("expected checkpoint to be persisted");
    assert_eq!(cp.timestamp, 2_000, "expected checkpoint timestamp 2000, got {}", cp.timestamp);

    store.drop_channel_checkpoint("wal-0").await?;
    let cp = store.get_channel_checkpoint("wal-0").await?;
    assert!(cp.is_none(), "expected checkpoint to be dropped, got {:?}", cp);

    Ok(())
}
