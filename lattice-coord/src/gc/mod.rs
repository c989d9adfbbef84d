//! Garbage collection of orphaned files & metadata.
//!
//! The collector reconciles the object store against the metadata store: dropped segments whose
//! compaction successors are fully indexed and whose channel checkpoints have advanced past
//! their DML positions are reclaimed, unreferenced index build directories are pruned, and a
//! slower residue scan sweeps objects which no longer appear in any metadata at all.


use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{StreamExt, TryStreamExt};
use lattice_core::AppError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::metastore::MetaStore;
use crate::models::{SegmentRecord, SegmentState, TaskState};
use crate::storage::ObjectStore;
use crate::utils;

const METRIC_GC_PASSES: &str = "lattice_coord_gc_passes";
const METRIC_GC_REMOVED_FILES: &str = "lattice_coord_gc_removed_files";

/// The object store prefix holding segment insert logs.
pub const SEGMENT_INSERT_LOG_PATH: &str = "insert_log";
/// The object store prefix holding segment statistics logs.
pub const SEGMENT_STATS_LOG_PATH: &str = "stats_log";
/// The object store prefix holding segment delta logs.
pub const SEGMENT_DELTA_LOG_PATH: &str = "delta_log";
/// The object store prefix holding built index files.
pub const SEGMENT_INDEX_PATH: &str = "index_files";

/// Garbage collection options.
#[derive(Clone, Debug)]
pub struct GcOption {
    /// The enable switch.
    pub enabled: bool,
    /// The interval between metadata & index GC passes.
    pub check_interval: Duration,
    /// The interval between object store residue scans.
    pub scan_interval: Duration,
    /// The minimum age of an unreferenced object before it may be reclaimed.
    pub missing_tolerance: Duration,
    /// The minimum age of a dropped segment before its files may be reclaimed.
    pub drop_tolerance: Duration,
    /// The parallelism of per-file deletes.
    pub remove_concurrency: usize,
}

impl GcOption {
    /// Build options from the runtime config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.gc_enabled,
            check_interval: config.gc_check_interval(),
            scan_interval: config.gc_scan_interval(),
            missing_tolerance: config.gc_missing_tolerance(),
            drop_tolerance: config.gc_drop_tolerance(),
            remove_concurrency: config.gc_remove_concurrency,
        }
    }
}

/// A command bound for the garbage collector.
enum GcCmd {
    /// Suspend collection for the given duration.
    Pause { duration: Duration, done: oneshot::Sender<()> },
    /// Resume collection immediately.
    Resume { done: oneshot::Sender<()> },
}

/// A live handle to the garbage collector.
#[derive(Clone)]
pub struct GcHandle {
    cmds: mpsc::Sender<GcCmd>,
    enabled: bool,
}

impl GcHandle {
    /// Suspend garbage collection for the given duration.
    ///
    /// A shorter pause never shortens a longer one already in effect.
    pub async fn pause(&self, duration: Duration) -> Result<()> {
        if !self.enabled {
            tracing::info!("garbage collection not enabled");
            return Ok(());
        }
        let (done, done_rx) = oneshot::channel();
        self.cmds
            .send(GcCmd::Pause { duration, done })
            .await
            .map_err(|_err| anyhow::anyhow!("garbage collector has shutdown"))?;
        done_rx.await.context("error awaiting garbage collector response")
    }

    /// Resume garbage collection immediately.
    pub async fn resume(&self) -> Result<()> {
        if !self.enabled {
            tracing::warn!("garbage collection not enabled, cannot resume");
            return Err(AppError::Unavailable("garbage collection not enabled".into()).into());
        }
        let (done, done_rx) = oneshot::channel();
        self.cmds
            .send(GcCmd::Resume { done })
            .await
            .map_err(|_err| anyhow::anyhow!("garbage collector has shutdown"))?;
        done_rx.await.context("error awaiting garbage collector response")
    }
}

/// A controller reclaiming orphaned files & metadata records.
pub struct GarbageCollector {
    /// Collection options.
    option: GcOption,
    /// The metadata store gateway.
    meta: MetaStore,
    /// The object store holding segment & index files.
    store: Arc<dyn ObjectStore>,

    /// A channel of inbound pause/resume commands.
    cmds_rx: ReceiverStream<GcCmd>,
    /// The instant collection is paused until.
    pause_until: Instant,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl GarbageCollector {
    /// Create a new instance.
    pub fn new(option: GcOption, meta: MetaStore, store: Arc<dyn ObjectStore>, shutdown: broadcast::Receiver<()>) -> (Self, GcHandle) {
        tracing::info!(
            enabled = option.enabled,
            check_interval_secs = option.check_interval.as_secs(),
            scan_interval_secs = option.scan_interval.as_secs(),
            missing_tolerance_secs = option.missing_tolerance.as_secs(),
            drop_tolerance_secs = option.drop_tolerance.as_secs(),
            "garbage collector options",
        );
        metrics::register_counter!(METRIC_GC_PASSES, metrics::Unit::Count, "completed garbage collection passes");
        metrics::register_counter!(METRIC_GC_REMOVED_FILES, metrics::Unit::Count, "files removed by garbage collection");
        let (cmds_tx, cmds_rx) = mpsc::channel(1);
        let enabled = option.enabled;
        (
            Self {
                option,
                meta,
                store,
                cmds_rx: ReceiverStream::new(cmds_rx),
                pause_until: Instant::now(),
                shutdown_rx: BroadcastStream::new(shutdown),
            },
            GcHandle { cmds: cmds_tx, enabled },
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        if !self.option.enabled {
            tracing::info!("garbage collection is disabled");
            return tokio::spawn(async { Ok(()) });
        }
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("garbage collector has started");
        let start = Instant::now();
        let mut check_ticker = tokio::time::interval_at(start + self.option.check_interval, self.option.check_interval);
        let mut scan_ticker = tokio::time::interval_at(start + self.option.scan_interval, self.option.scan_interval);

        loop {
            tokio::select! {
                _ = check_ticker.tick() => {
                    if Instant::now() < self.pause_until {
                        tracing::info!("garbage collector is paused");
                        continue;
                    }
                    self.check_pass().await;
                }
                _ = scan_ticker.tick() => {
                    if Instant::now() < self.pause_until {
                        continue;
                    }
                    tracing::info!("garbage collector starting residue scan");
                    if let Err(err) = self.scan_residue().await {
                        tracing::error!(error = ?err, "error during object residue scan");
                    }
                }
                Some(cmd) = self.cmds_rx.next() => self.handle_cmd(cmd),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("garbage collector has shutdown");
        Ok(())
    }

    /// Handle a pause/resume command.
    fn handle_cmd(&mut self, cmd: GcCmd) {
        match cmd {
            GcCmd::Pause { duration, done } => {
                let pause_until = Instant::now() + duration;
                if pause_until > self.pause_until {
                    tracing::info!(duration_secs = duration.as_secs(), "garbage collection paused");
                    self.pause_until = pause_until;
                } else {
                    tracing::info!(duration_secs = duration.as_secs(), "pause request ends before the current pause, ignoring");
                }
                let _res = done.send(());
            }
            GcCmd::Resume { done } => {
                self.pause_until = Instant::now();
                tracing::info!("garbage collection resumed");
                let _res = done.send(());
            }
        }
    }

    /// Execute one metadata & index GC pass.
    async fn check_pass(&self) {
        if let Err(err) = self.recycle_dropped_segments().await {
            tracing::error!(error = ?err, "error recycling dropped segments");
        }
        if let Err(err) = self.recycle_unused_indexes().await {
            tracing::error!(error = ?err, "error recycling unused index metadata");
        }
        if let Err(err) = self.recycle_index_files().await {
            tracing::error!(error = ?err, "error recycling unused index files");
        }
        metrics::increment_counter!(METRIC_GC_PASSES);
    }

    /// Reclaim the log files and records of dropped segments.
    ///
    /// A compaction source is only reclaimed once its successor is fully indexed, so replacing
    /// the sources with the compacted segment never degrades query performance. Reclamation
    /// additionally waits for the channel checkpoint to pass the segment's DML position while
    /// the channel still exists.
    async fn recycle_dropped_segments(&self) -> Result<()> {
        let segments = self.meta.list_segments().await?;
        let mut drops: BTreeMap<i64, SegmentRecord> = BTreeMap::new();
        let mut compact_to: HashMap<i64, SegmentRecord> = HashMap::new();
        let mut channels: HashSet<String> = HashSet::new();
        for segment in &segments {
            if segment.segment_state() == SegmentState::Dropped {
                drops.insert(segment.segment_id, segment.clone());
                channels.insert(segment.channel.clone());
            }
            for from in &segment.compaction_from {
                compact_to.insert(*from, segment.clone());
            }
        }
        if drops.is_empty() {
            return Ok(());
        }

        let indexes = self.meta.list_indexes().await?;
        let indexed: HashSet<i64> = indexes
            .iter()
            .filter(|index| !index.dropped && index.index_state() == TaskState::Finished)
            .map(|index| index.segment_id)
            .collect();
        let mut checkpoints: HashMap<String, i64> = HashMap::new();
        for channel in &channels {
            let timestamp = self
                .meta
                .get_channel_checkpoint(channel)
                .await?
                .map(|cp| cp.timestamp)
                .unwrap_or(0);
            checkpoints.insert(channel.clone(), timestamp);
        }

        tracing::info!(dropped = drops.len(), "starting dropped segment GC");
        for (segment_id, segment) in drops {
            let checkpoint = checkpoints.get(&segment.channel).copied().unwrap_or(0);
            if !self.can_recycle_segment(&segment, compact_to.get(&segment_id), &indexed, checkpoint).await? {
                continue;
            }
            tracing::info!(segment = segment_id, logs = segment.log_paths.len(), "reclaiming dropped segment");
            if !self.remove_logs(&segment.log_paths).await {
                continue;
            }
            if let Err(err) = self.meta.drop_segment(segment_id).await {
                tracing::info!(error = ?err, segment = segment_id, "failed to drop segment record after file reclamation");
                continue;
            }
            // With the channel fully drained and retired, its checkpoint record goes too.
            let remaining = self.meta.segments_by_channel(&segment.channel).await?;
            if remaining.is_empty() && self.meta.get_pchannel(&segment.channel).await?.is_none() {
                tracing::info!(channel = %segment.channel, "empty channel found during GC, dropping channel checkpoint");
                if let Err(err) = self.meta.drop_channel_checkpoint(&segment.channel).await {
                    tracing::info!(error = ?err, channel = %segment.channel, "failed to drop channel checkpoint");
                }
            }
        }
        Ok(())
    }

    /// Check whether the given dropped segment may be reclaimed.
    async fn can_recycle_segment(
        &self, segment: &SegmentRecord, child: Option<&SegmentRecord>, indexed: &HashSet<i64>, checkpoint: i64,
    ) -> Result<bool> {
        let compacted = child.is_some() || !segment.compaction_from.is_empty();
        if compacted {
            // For compact A, B -> C, don't reclaim A or B while C is not indexed.
            if let Some(child) = child {
                if !indexed.contains(&child.segment_id) {
                    tracing::debug!(
                        segment = segment.segment_id,
                        child = child.segment_id,
                        "skipping GC while the compaction target is not indexed",
                    );
                    return Ok(false);
                }
            }
        } else if !self.drop_expired(segment.dropped_at) {
            return Ok(false);
        }
        // Reclamation may only happen once the channel checkpoint passes the segment's DML
        // position; a missing channel record means the whole collection is being torn down.
        if self.meta.get_pchannel(&segment.channel).await?.is_some() && segment.dml_timestamp > checkpoint {
            tracing::debug!(
                segment = segment.segment_id,
                dml_ts = segment.dml_timestamp,
                checkpoint_ts = checkpoint,
                "skipping GC while the segment's DML position is past the channel checkpoint",
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Check if the given drop timestamp is past the drop tolerance.
    fn drop_expired(&self, dropped_at: i64) -> bool {
        let age = utils::now_timestamp().saturating_sub(dropped_at);
        age > self.option.drop_tolerance.as_secs() as i64
    }

    /// Delete the given log files through the bounded removal pool.
    ///
    /// Returns false if any delete failed; the segment record is then left for the next pass.
    async fn remove_logs(&self, paths: &[String]) -> bool {
        let res = futures::stream::iter(paths.iter().cloned().map(Ok::<String, anyhow::Error>))
            .try_for_each_concurrent(self.option.remove_concurrency, |path| {
                let store = self.store.clone();
                async move {
                    store.remove(&path).await?;
                    metrics::increment_counter!(METRIC_GC_REMOVED_FILES);
                    Ok(())
                }
            })
            .await;
        match res {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = ?err, "error removing segment log files");
                false
            }
        }
    }

    /// Drop index records which are marked dropped or whose segment no longer exists.
    async fn recycle_unused_indexes(&self) -> Result<()> {
        let segments: HashSet<i64> = self.meta.list_segments().await?.into_iter().map(|seg| seg.segment_id).collect();
        for index in self.meta.list_indexes().await? {
            if !index.dropped && segments.contains(&index.segment_id) {
                continue;
            }
            match self.meta.drop_index(index.build_id).await {
                Ok(()) => tracing::info!(build = index.build_id, segment = index.segment_id, "index record recycled"),
                Err(err) => tracing::warn!(error = ?err, build = index.build_id, "error recycling index record, will retry"),
            }
        }
        Ok(())
    }

    /// Reclaim index files which are no longer referenced by index metadata.
    async fn recycle_index_files(&self) -> Result<()> {
        let prefix = format!("{}/{}/", self.store.root_path(), SEGMENT_INDEX_PATH);
        let entries = self.store.list_with_prefix(&prefix, false).await?;
        for entry in entries {
            let build_id = match parse_build_id(&entry.path) {
                Some(build_id) => build_id,
                None => {
                    tracing::warn!(key = %entry.path, "unparsable index build directory, skipping");
                    continue;
                }
            };
            let index = match self.meta.get_index(build_id).await? {
                // The build no longer exists in metadata: remove the whole subtree.
                None => {
                    tracing::info!(build = build_id, "index build not found in metadata, removing its files");
                    if let Err(err) = self.store.remove_with_prefix(&entry.path).await {
                        tracing::warn!(error = ?err, build = build_id, "error removing index build directory");
                    }
                    continue;
                }
                // Dropped index meta is recycled first; its files go on a later pass.
                Some(index) if index.dropped => continue,
                Some(index) => index,
            };
            let keep: HashSet<String> = index
                .file_keys
                .iter()
                .map(|key| index_file_path(self.store.root_path(), build_id, key))
                .collect();
            let mut removed = 0;
            for file in self.store.list_with_prefix(&entry.path, true).await? {
                if keep.contains(&file.path) {
                    continue;
                }
                match self.store.remove(&file.path).await {
                    Ok(()) => {
                        removed += 1;
                        metrics::increment_counter!(METRIC_GC_REMOVED_FILES);
                    }
                    Err(err) => tracing::warn!(error = ?err, file = %file.path, "error removing stale index file"),
                }
            }
            if removed > 0 {
                tracing::info!(build = build_id, removed, "stale index files recycled");
            }
        }
        Ok(())
    }

    /// Sweep the log prefixes for objects which no metadata references.
    async fn scan_residue(&self) -> Result<()> {
        let (mut total, mut valid, mut missing) = (0u64, 0u64, 0u64);
        let now = time::OffsetDateTime::now_utc();
        let tolerance = time::Duration::seconds(self.option.missing_tolerance.as_secs() as i64);
        for log_prefix in [SEGMENT_INSERT_LOG_PATH, SEGMENT_STATS_LOG_PATH, SEGMENT_DELTA_LOG_PATH] {
            let prefix = format!("{}/{}/", self.store.root_path(), log_prefix);
            let started_at = Instant::now();
            for object in self.store.list_with_prefix(&prefix, true).await? {
                // Fresh objects may belong to an in-flight write; leave them alone.
                if now - object.modified_at <= tolerance {
                    continue;
                }
                total += 1;
                let segment_id = match parse_segment_id(&object.path) {
                    Some(segment_id) => segment_id,
                    None => {
                        missing += 1;
                        tracing::warn!(key = %object.path, "unparsable log object key");
                        continue;
                    }
                };
                let referenced = match self.meta.get_segment(segment_id).await? {
                    None => false,
                    // Insert logs are referenced by the segment's existence; stats & delta
                    // logs must appear in the record's path set.
                    Some(segment) => log_prefix == SEGMENT_INSERT_LOG_PATH || segment.log_paths.contains(&object.path),
                };
                if referenced {
                    valid += 1;
                    continue;
                }
                match self.store.remove(&object.path).await {
                    Ok(()) => metrics::increment_counter!(METRIC_GC_REMOVED_FILES),
                    Err(err) => {
                        missing += 1;
                        tracing::error!(error = ?err, key = %object.path, "error removing residue object");
                    }
                }
            }
            tracing::info!(prefix = %prefix, elapsed_ms = started_at.elapsed().as_millis() as u64, "residue scan finished one prefix");
        }
        tracing::info!(total, valid, missing, "object residue scan complete");
        Ok(())
    }
}

/// Parse the segment ID out of a log object key of the form
/// `<root>/<log_prefix>/<collection>/<segment>/<file>`.
fn parse_segment_id(path: &str) -> Option<i64> {
    let mut parts = path.rsplit('/');
    let _file = parts.next()?;
    parts.next()?.parse().ok()
}

/// Parse the build ID out of an index build directory key of the form
/// `<root>/index_files/<build_id>`.
fn parse_build_id(path: &str) -> Option<i64> {
    path.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

/// Build the full key of an index file within a build directory.
pub fn index_file_path(root: &str, build_id: i64, file_key: &str) -> String {
    format!("{}/{}/{}/{}", root, SEGMENT_INDEX_PATH, build_id, file_key)
}

/// Build the full key of a segment log file.
pub fn segment_log_path(root: &str, log_prefix: &str, collection_id: i64, segment_id: i64, name: &str) -> String {
    format!("{}/{}/{}/{}/{}", root, log_prefix, collection_id, segment_id, name)
}
