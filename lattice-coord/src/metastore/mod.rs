//! Metadata store gateway.
//!
//! All durable state of the coordinator flows through this gateway: physical channel metadata,
//! worker task records, segment & index metadata, per-channel checkpoints and one-time cluster
//! flags. Every write is idempotent by key and flushed before the call returns, so callers may
//! safely expose new state only after the corresponding gateway call has succeeded. Writes are
//! retried with bounded exponential backoff to ride out transient store errors.

#[cfg(test)]
mod mod_test;

use std::time::Duration;

use anyhow::{Context, Result};

use crate::database::{Database, Tree};
use crate::error::{ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::models::{CheckpointRecord, IndexRecord, PChannelMeta, SegmentRecord, TaskKind, TaskRecord};
use crate::utils;

/// The key under which the one-time streaming-enabled version is stored.
const KEY_STREAMING_VERSION: &str = "streaming_version";

/// The max number of attempts for a metadata store write.
const WRITE_ATTEMPTS: u32 = 3;
/// The base delay of the write retry backoff, doubled on every attempt.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// The gateway to the coordinator's durable metadata.
#[derive(Clone)]
pub struct MetaStore {
    channels: Tree,
    tasks: Tree,
    segments: Tree,
    indexes: Tree,
    checkpoints: Tree,
    flags: Tree,
}

impl MetaStore {
    /// Create a new instance over the given database.
    pub async fn new(db: &Database) -> Result<Self> {
        Ok(Self {
            channels: db.get_channels_tree().await?,
            tasks: db.get_tasks_tree().await?,
            segments: db.get_segments_tree().await?,
            indexes: db.get_indexes_tree().await?,
            checkpoints: db.get_checkpoints_tree().await?,
            flags: db.get_flags_tree().await?,
        })
    }

    //////////////////////////////////////////////////////////////////////////
    // Physical channels /////////////////////////////////////////////////////

    /// List all persisted physical channel metadata.
    pub async fn list_pchannels(&self) -> Result<Vec<PChannelMeta>> {
        let tree = self.channels.clone();
        list_records(tree, None, "channel").await
    }

    /// Get the persisted metadata of the target channel.
    pub async fn get_pchannel(&self, name: &str) -> Result<Option<PChannelMeta>> {
        get_record(self.channels.clone(), name.as_bytes().to_vec(), "channel").await
    }

    /// Idempotently save the given channel metadata, durable before return.
    pub async fn put_pchannel(&self, meta: &PChannelMeta) -> Result<()> {
        let buf = utils::encode_model(meta)?;
        put_record(self.channels.clone(), meta.name.as_bytes().to_vec(), buf, "put_pchannel").await
    }

    /// Get the one-time streaming-enabled version, if it has been persisted.
    pub async fn get_streaming_version(&self) -> Result<Option<u64>> {
        let tree = self.flags.clone();
        let val = Database::spawn_blocking(move || tree.get(KEY_STREAMING_VERSION.as_bytes()))
            .await?
            .context("error fetching streaming version flag")?;
        val.map(|ivec| utils::decode_u64(&ivec)).transpose()
    }

    /// Persist the one-time streaming-enabled version.
    pub async fn put_streaming_version(&self, version: u64) -> Result<()> {
        let buf = utils::encode_u64(version).to_vec();
        put_record(self.flags.clone(), KEY_STREAMING_VERSION.as_bytes().to_vec(), buf, "put_streaming_version").await
    }

    //////////////////////////////////////////////////////////////////////////
    // Worker tasks //////////////////////////////////////////////////////////

    /// List all persisted task records of the given kind.
    pub async fn list_tasks(&self, kind: TaskKind) -> Result<Vec<TaskRecord>> {
        let prefix = format!("{}/", kind.as_str()).into_bytes();
        list_records(self.tasks.clone(), Some(prefix), "task").await
    }

    /// Get the persisted record of the target task.
    pub async fn get_task_record(&self, kind: TaskKind, task_id: i64) -> Result<Option<TaskRecord>> {
        get_record(self.tasks.clone(), task_key(kind, task_id), "task").await
    }

    /// Idempotently save the given task record, durable before return.
    pub async fn put_task_record(&self, record: &TaskRecord) -> Result<()> {
        let buf = utils::encode_model(record)?;
        put_record(self.tasks.clone(), task_key(record.task_kind(), record.task_id), buf, "put_task_record").await
    }

    /// Delete the persisted record of the target task.
    pub async fn drop_task_record(&self, kind: TaskKind, task_id: i64) -> Result<()> {
        drop_record(self.tasks.clone(), task_key(kind, task_id), "drop_task_record").await
    }

    //////////////////////////////////////////////////////////////////////////
    // Segments & indexes ////////////////////////////////////////////////////

    /// List all persisted segment records.
    pub async fn list_segments(&self) -> Result<Vec<SegmentRecord>> {
        list_records(self.segments.clone(), None, "segment").await
    }

    /// Get the persisted record of the target segment.
    pub async fn get_segment(&self, segment_id: i64) -> Result<Option<SegmentRecord>> {
        get_record(self.segments.clone(), utils::encode_i64(segment_id).to_vec(), "segment").await
    }

    /// Idempotently save the given segment record, durable before return.
    pub async fn put_segment(&self, record: &SegmentRecord) -> Result<()> {
        let buf = utils::encode_model(record)?;
        put_record(self.segments.clone(), utils::encode_i64(record.segment_id).to_vec(), buf, "put_segment").await
    }

    /// Delete the persisted record of the target segment.
    pub async fn drop_segment(&self, segment_id: i64) -> Result<()> {
        drop_record(self.segments.clone(), utils::encode_i64(segment_id).to_vec(), "drop_segment").await
    }

    /// List all persisted segment records riding the target channel.
    pub async fn segments_by_channel(&self, channel: &str) -> Result<Vec<SegmentRecord>> {
        let all = self.list_segments().await?;
        Ok(all.into_iter().filter(|seg| seg.channel == channel).collect())
    }

    /// List all persisted index records.
    pub async fn list_indexes(&self) -> Result<Vec<IndexRecord>> {
        list_records(self.indexes.clone(), None, "index").await
    }

    /// Get the persisted record of the target index build.
    pub async fn get_index(&self, build_id: i64) -> Result<Option<IndexRecord>> {
        get_record(self.indexes.clone(), utils::encode_i64(build_id).to_vec(), "index").await
    }

    /// Idempotently save the given index record, durable before return.
    pub async fn put_index(&self, record: &IndexRecord) -> Result<()> {
        let buf = utils::encode_model(record)?;
        put_record(self.indexes.clone(), utils::encode_i64(record.build_id).to_vec(), buf, "put_index").await
    }

    /// Delete the persisted record of the target index build.
    pub async fn drop_index(&self, build_id: i64) -> Result<()> {
        drop_record(self.indexes.clone(), utils::encode_i64(build_id).to_vec(), "drop_index").await
    }

    //////////////////////////////////////////////////////////////////////////
    // Channel checkpoints ///////////////////////////////////////////////////

    /// Idempotently save the replication checkpoint of the target channel.
    pub async fn save_channel_checkpoint(&self, channel: &str, timestamp: i64) -> Result<()> {
        let record = CheckpointRecord { channel: channel.to_string(), timestamp };
        let buf = utils::encode_model(&record)?;
        put_record(self.checkpoints.clone(), channel.as_bytes().to_vec(), buf, "save_channel_checkpoint").await
    }

    /// Get the replication checkpoint of the target channel.
    pub async fn get_channel_checkpoint(&self, channel: &str) -> Result<Option<CheckpointRecord>> {
        get_record(self.checkpoints.clone(), channel.as_bytes().to_vec(), "checkpoint").await
    }

    /// Delete the replication checkpoint of the target channel.
    pub async fn drop_channel_checkpoint(&self, channel: &str) -> Result<()> {
        drop_record(self.checkpoints.clone(), channel.as_bytes().to_vec(), "drop_channel_checkpoint").await
    }
}

/// The storage key of a task record.
fn task_key(kind: TaskKind, task_id: i64) -> Vec<u8> {
    let mut key = format!("{}/", kind.as_str()).into_bytes();
    key.extend_from_slice(&utils::encode_i64(task_id));
    key
}

/// List all records under the given optional key prefix, skipping corrupt entries.
async fn list_records<M: prost::Message + Default + Send + 'static>(tree: Tree, prefix: Option<Vec<u8>>, entity: &'static str) -> Result<Vec<M>> {
    Database::spawn_blocking(move || -> Result<Vec<M>> {
        let iter = match &prefix {
            Some(prefix) => tree.scan_prefix(prefix),
            None => tree.iter(),
        };
        let mut out = Vec::new();
        for kv_res in iter {
            let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
            match utils::decode_model::<M>(val.as_ref()) {
                Ok(model) => out.push(model),
                // Refuse to progress a corrupt entity, but keep serving the rest.
                Err(err) => tracing::error!(error = ?err, key = ?key, "corrupt {} record in metadata store, skipping", entity),
            }
        }
        Ok(out)
    })
    .await?
}

/// Fetch and decode a single record by key.
async fn get_record<M: prost::Message + Default + Send + 'static>(tree: Tree, key: Vec<u8>, entity: &'static str) -> Result<Option<M>> {
    let val = Database::spawn_blocking(move || tree.get(&key))
        .await?
        .with_context(|| format!("error fetching {} record", entity))?;
    val.map(|ivec| utils::decode_model(ivec.as_ref())).transpose()
}

/// Write the given record, flushing before return, retrying transient errors with backoff.
async fn put_record(tree: Tree, key: Vec<u8>, buf: Vec<u8>, op: &'static str) -> Result<()> {
    with_write_retries(op, move || {
        let (tree, key, buf) = (tree.clone(), key.clone(), buf.clone());
        async move {
            Database::spawn_blocking(move || -> Result<()> {
                tree.insert(key, buf).context("error writing record to metadata store")?;
                tree.flush().context(ERR_DB_FLUSH)?;
                Ok(())
            })
            .await?
        }
    })
    .await
}

/// Delete the record under the given key, flushing before return, retrying transient errors.
async fn drop_record(tree: Tree, key: Vec<u8>, op: &'static str) -> Result<()> {
    with_write_retries(op, move || {
        let (tree, key) = (tree.clone(), key.clone());
        async move {
            Database::spawn_blocking(move || -> Result<()> {
                tree.remove(key).context("error deleting record from metadata store")?;
                tree.flush().context(ERR_DB_FLUSH)?;
                Ok(())
            })
            .await?
        }
    })
    .await
}

/// Drive the given write operation with bounded exponential backoff.
async fn with_write_retries<F, Fut>(op: &'static str, f: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut delay = WRITE_RETRY_DELAY;
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= WRITE_ATTEMPTS => return Err(err.context(op)),
            Err(err) => {
                tracing::warn!(error = ?err, attempt, "transient metadata store error during {}", op);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}
