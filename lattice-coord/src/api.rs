//! Coordinator control surface.
//!
//! `ControlApi` aggregates the live handles of the control-plane components and exposes the
//! operations callers are allowed to reach. The RPC server which fronts this surface is pure
//! transport plumbing and lives outside the core; it forwards unary calls here and bridges its
//! bidirectional streams onto `open_assignment_stream`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::balancer::BalancerHandle;
use crate::config::Config;
use crate::discovery::{AssignmentUpdate, DiscoveryRequest, DiscoverySession};
use crate::error::RpcResult;
use crate::gc::GcHandle;
use crate::models::{AccessMode, TaskRecord};
use crate::scheduler::task::{task_from_record, TaskSnapshot};
use crate::scheduler::TaskScheduler;

/// The coordinator's exposed control surface.
#[derive(Clone)]
pub struct ControlApi {
    /// The application's runtime config.
    config: Arc<Config>,
    /// A handle to the channel balancer.
    balancer: BalancerHandle,
    /// A handle to the task scheduler.
    scheduler: TaskScheduler,
    /// A handle to the garbage collector.
    gc: GcHandle,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlApi {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, balancer: BalancerHandle, scheduler: TaskScheduler, gc: GcHandle, shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            balancer,
            scheduler,
            gc,
            shutdown_tx,
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Balancer control //////////////////////////////////////////////////////

    /// Locate the node currently responsible for the target channel.
    pub fn locate(&self, channel: &str) -> Option<(i64, bool)> {
        self.balancer.locate(channel)
    }

    /// Declare the given `(channel, vchannel_count)` pairs.
    pub async fn declare_channels(&self, channels: Vec<(String, u32)>) -> Result<()> {
        self.balancer.declare_channels(channels).await
    }

    /// Apply the given assignment updates as a single batch.
    pub async fn assign(&self, updates: HashMap<String, (AccessMode, i64)>) -> Result<()> {
        self.balancer.assign(updates).await
    }

    /// Acknowledge that the target node has taken ownership of the channel.
    pub async fn confirm_channel(&self, channel: &str) -> Result<()> {
        self.balancer.confirm(channel).await
    }

    /// Take the given channels out of service.
    pub async fn mark_unavailable(&self, channels: Vec<String>) -> Result<()> {
        self.balancer.mark_unavailable(channels).await
    }

    /// Force a balance pass.
    pub async fn trigger_rebalance(&self) -> Result<()> {
        self.balancer.trigger().await
    }

    /// Persist the one-time streaming-enabled marker.
    pub async fn enable_streaming(&self) -> Result<()> {
        self.balancer.enable_streaming().await
    }

    /// Register a notifier which resolves once streaming is enabled.
    pub async fn streaming_enabled_notifier(&self) -> Result<oneshot::Receiver<()>> {
        self.balancer.streaming_enabled_notifier().await
    }

    /// Open an assignment discovery session over the given channel pair.
    pub fn open_assignment_stream(
        &self, tx: mpsc::Sender<RpcResult<AssignmentUpdate>>, rx: mpsc::Receiver<DiscoveryRequest>,
    ) -> JoinHandle<Result<()>> {
        DiscoverySession::new(self.balancer.clone(), tx, rx, self.shutdown_tx.subscribe()).spawn()
    }

    //////////////////////////////////////////////////////////////////////////
    // Scheduler control /////////////////////////////////////////////////////

    /// Submit the given task record for execution.
    ///
    /// Validation failures surface synchronously; success means the task has been queued, and
    /// its progress is observable through `task_stats`.
    pub async fn submit_task(&self, record: TaskRecord) -> Result<()> {
        let task = task_from_record(record, &self.config.cluster_name)?;
        self.scheduler.enqueue(task).await
    }

    /// Abort the target task.
    pub async fn abort_task(&self, task_id: i64) {
        self.scheduler.abort(task_id).await;
    }

    /// Check if the target task is currently tracked.
    pub async fn task_exists(&self, task_id: i64) -> bool {
        self.scheduler.exists(task_id).await
    }

    /// A snapshot of the target task's externally visible state.
    pub async fn task_stats(&self, task_id: i64) -> Option<TaskSnapshot> {
        self.scheduler.task_stats(task_id).await
    }

    //////////////////////////////////////////////////////////////////////////
    // GC control ////////////////////////////////////////////////////////////

    /// Suspend garbage collection for the given duration.
    pub async fn gc_pause(&self, duration: Duration) -> Result<()> {
        self.gc.pause(duration).await
    }

    /// Resume garbage collection immediately.
    pub async fn gc_resume(&self) -> Result<()> {
        self.gc.resume().await
    }
}
