//! Worker registry & session watcher.
//!
//! Node liveness is driven by an external session/lease mechanism which emits edge-triggered
//! join/leave events. The watcher folds those events into a read-mostly map of live workers,
//! and publishes the membership set for components which need to react to topology changes.

#[cfg(test)]
mod mod_test;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::models::{JobRequest, JobStatus};

const METRIC_REGISTERED_WORKERS: &str = "lattice_coord_registered_workers";

/// The timeout applied to a single worker slot query.
const SLOT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// The worker RPC surface consumed by the coordinator.
#[async_trait]
pub trait WorkerClient: Send + Sync + 'static {
    /// Query the worker's currently available task slots.
    async fn query_slots(&self) -> Result<i64>;

    /// Submit a job to the worker.
    async fn create_job(&self, req: JobRequest) -> Result<()>;

    /// Query the state of a job previously submitted to the worker.
    async fn query_job(&self, task_id: i64) -> Result<JobStatus>;

    /// Drop a job from the worker, releasing any resources it holds.
    async fn drop_job(&self, task_id: i64) -> Result<()>;
}

/// A registered worker node.
#[derive(Clone)]
pub struct WorkerNode {
    /// The unique ID of the node.
    pub node_id: i64,
    /// The network endpoint of the node.
    pub endpoint: String,
    /// The RPC client handle of the node.
    pub client: Arc<dyn WorkerClient>,
}

/// A point-in-time snapshot of a worker's available slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSlots {
    /// The unique ID of the node.
    pub node_id: i64,
    /// The number of task slots the node currently has free.
    pub available_slots: i64,
}

/// A map of all live worker nodes keyed by node ID.
pub type NodesMap = Arc<ArcSwap<HashMap<i64, WorkerNode>>>;

/// An edge-triggered node membership event from the session/lease system.
pub enum SessionEvent {
    /// A node has established a session.
    NodeJoin {
        node_id: i64,
        endpoint: String,
        client: Arc<dyn WorkerClient>,
    },
    /// A node's session lease has expired.
    NodeLeave { node_id: i64 },
}

/// A live handle to the worker registry.
#[derive(Clone)]
pub struct WorkerRegistry {
    nodes: NodesMap,
    membership: watch::Receiver<Vec<i64>>,
}

impl WorkerRegistry {
    /// Query every live worker for its available slots, returning a snapshot copy.
    ///
    /// The returned map is owned by the caller, which may freely mutate it to reserve slots
    /// during a dispatch pass without racing other passes. Workers which fail or time out are
    /// simply absent from the snapshot.
    pub async fn query_all_slots(&self) -> HashMap<i64, WorkerSlots> {
        let nodes = self.nodes.load_full();
        let mut slots = HashMap::with_capacity(nodes.len());
        for (node_id, node) in nodes.iter() {
            match tokio::time::timeout(SLOT_QUERY_TIMEOUT, node.client.query_slots()).await {
                Ok(Ok(available)) => {
                    slots.insert(*node_id, WorkerSlots { node_id: *node_id, available_slots: available.max(0) });
                }
                Ok(Err(err)) => tracing::warn!(error = ?err, node = node_id, "error querying worker slots"),
                Err(_) => tracing::warn!(node = node_id, "timeout querying worker slots"),
            }
        }
        slots
    }

    /// Get an RPC client for the target node, if it is still registered.
    pub fn get_client(&self, node_id: i64) -> Option<Arc<dyn WorkerClient>> {
        self.nodes.load().get(&node_id).map(|node| node.client.clone())
    }

    /// The IDs of all currently registered nodes, sorted ascending.
    pub fn nodes(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.nodes.load().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// A watch of the registry's membership set.
    pub fn membership(&self) -> watch::Receiver<Vec<i64>> {
        self.membership.clone()
    }
}

/// A controller folding session events into the worker registry.
pub struct SessionWatcher {
    /// A channel of inbound session events.
    events: ReceiverStream<SessionEvent>,
    /// The map of live worker nodes.
    nodes: NodesMap,
    /// The membership set publication channel.
    membership: watch::Sender<Vec<i64>>,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl SessionWatcher {
    /// Create a new instance.
    pub fn new(events: mpsc::Receiver<SessionEvent>, shutdown: broadcast::Receiver<()>) -> (Self, WorkerRegistry) {
        metrics::register_gauge!(METRIC_REGISTERED_WORKERS, metrics::Unit::Count, "number of currently registered worker nodes");
        let nodes: NodesMap = Default::default();
        let (membership_tx, membership_rx) = watch::channel(vec![]);
        (
            Self {
                events: ReceiverStream::new(events),
                nodes: nodes.clone(),
                membership: membership_tx,
                shutdown: BroadcastStream::new(shutdown),
            },
            WorkerRegistry {
                nodes,
                membership: membership_rx,
            },
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("worker session watcher initialized");
        loop {
            tokio::select! {
                Some(event) = self.events.next() => self.handle_session_event(event),
                _ = self.shutdown.next() => break,
            }
        }
        Ok(())
    }

    /// Handle a session event from the external lease system.
    #[tracing::instrument(level = "debug", skip(self, event))]
    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::NodeJoin { node_id, endpoint, client } => {
                tracing::info!(node = node_id, endpoint = %endpoint, "worker node joined");
                let orig = self.nodes.load_full();
                let mut updated = orig.as_ref().clone();
                updated.insert(node_id, WorkerNode { node_id, endpoint, client });
                self.nodes.store(Arc::new(updated));
            }
            SessionEvent::NodeLeave { node_id } => {
                tracing::info!(node = node_id, "worker node left");
                let orig = self.nodes.load_full();
                let mut updated = orig.as_ref().clone();
                if updated.remove(&node_id).is_none() {
                    tracing::debug!(node = node_id, "departing worker node was not registered");
                }
                self.nodes.store(Arc::new(updated));
            }
        }
        self.publish_membership();
    }

    /// Publish the current membership set to all receivers.
    fn publish_membership(&self) {
        let mut ids: Vec<i64> = self.nodes.load().keys().copied().collect();
        ids.sort_unstable();
        metrics::gauge!(METRIC_REGISTERED_WORKERS, ids.len() as f64);
        let _res = self.membership.send(ids);
    }
}
