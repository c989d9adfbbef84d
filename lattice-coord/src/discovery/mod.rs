//! Assignment discovery.
//!
//! One long-lived session per client. The session sends the full assignment view on connect,
//! then one delta frame per version bump. The transport adapter which bridges the coordinator's
//! gRPC stream onto the session's channel pair lives outside the core; the session itself only
//! deals with frames.


use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tonic::Status;
use uuid::Uuid;

use crate::balancer::{AssignmentView, BalancerHandle, ChannelAssignment, ViewVersion};
use crate::error::RpcResult;

const METRIC_DISCOVERY_SESSIONS: &str = "lattice_coord_discovery_sessions";

/// A client acknowledgement of a received view version.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscoveryRequest {
    /// The last version the client has fully applied.
    pub last_seen: Option<ViewVersion>,
}

/// A single frame of the assignment discovery stream.
#[derive(Clone, Debug)]
pub struct AssignmentUpdate {
    /// The version pair of the view this frame advances the client to.
    pub version: ViewVersion,
    /// A bool indicating that this frame carries the full view rather than a delta.
    pub full: bool,
    /// Channels newly present since the client's last frame.
    pub added: Vec<ChannelAssignment>,
    /// Channels whose assignment changed since the client's last frame.
    pub changed: Vec<ChannelAssignment>,
    /// Names of channels removed since the client's last frame.
    pub removed: Vec<String>,
}

/// A single client's assignment discovery session.
pub struct DiscoverySession {
    /// The unique ID of this session.
    id: Uuid,
    /// A handle to the channel balancer.
    balancer: BalancerHandle,
    /// The outbound frame channel.
    tx: mpsc::Sender<RpcResult<AssignmentUpdate>>,
    /// The inbound acknowledgement channel.
    rx: ReceiverStream<DiscoveryRequest>,
    /// The view described by the last frame sent.
    last_sent: Arc<AssignmentView>,
    /// The last version acknowledged by the client.
    last_acked: Option<ViewVersion>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl DiscoverySession {
    /// Create a new instance.
    pub fn new(
        balancer: BalancerHandle, tx: mpsc::Sender<RpcResult<AssignmentUpdate>>, rx: mpsc::Receiver<DiscoveryRequest>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        metrics::register_gauge!(METRIC_DISCOVERY_SESSIONS, metrics::Unit::Count, "number of live assignment discovery sessions");
        Self {
            id: Uuid::new_v4(),
            balancer,
            tx,
            rx: ReceiverStream::new(rx),
            last_sent: Arc::new(AssignmentView::default()),
            last_acked: None,
            shutdown_rx: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let (initial, mut updates) = self.balancer.subscribe();
        tracing::debug!(session = ?self.id, version = ?initial.version, "assignment discovery session started");
        metrics::increment_gauge!(METRIC_DISCOVERY_SESSIONS, 1.0);

        if self.send_full(initial).await {
            loop {
                tokio::select! {
                    res = updates.recv() => match res {
                        Ok(view) => {
                            if !self.handle_view_update(view).await {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(session = ?self.id, skipped, "discovery session lagged behind assignment updates, resyncing");
                            let view = self.balancer.current_view();
                            if !self.send_full(view).await {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _res = self.tx.send(Err(Status::unavailable("channel balancer has shutdown"))).await;
                            break;
                        }
                    },
                    ack = self.rx.next() => match ack {
                        Some(req) => {
                            if !self.handle_ack(req).await {
                                break;
                            }
                        }
                        // The client has disconnected.
                        None => break,
                    },
                    _ = self.shutdown_rx.next() => break,
                }
            }
        }

        metrics::decrement_gauge!(METRIC_DISCOVERY_SESSIONS, 1.0);
        tracing::debug!(session = ?self.id, "assignment discovery session closed");
        Ok(())
    }

    /// Send the given view as a full frame, returning false if the client is gone.
    async fn send_full(&mut self, view: Arc<AssignmentView>) -> bool {
        let frame = AssignmentUpdate {
            version: view.version,
            full: true,
            added: view.channels.values().cloned().collect(),
            changed: vec![],
            removed: vec![],
        };
        let sent = self.tx.send(Ok(frame)).await.is_ok();
        if sent {
            self.last_sent = view;
        }
        sent
    }

    /// Handle a fresh view from the balancer, returning false when the session must end.
    async fn handle_view_update(&mut self, view: Arc<AssignmentView>) -> bool {
        if view.version == self.last_sent.version {
            return true;
        }
        // An epoch change forcibly re-initializes the stream.
        if view.version.epoch != self.last_sent.version.epoch {
            return self.send_full(view).await;
        }
        if let Some(acked) = self.last_acked {
            // The client already holds this view, e.g. across a resubscribe.
            if !view.version.is_newer_than(&acked) {
                self.last_sent = view;
                return true;
            }
        }
        let frame = delta(&self.last_sent, &view);
        let sent = self.tx.send(Ok(frame)).await.is_ok();
        if sent {
            self.last_sent = view;
        }
        sent
    }

    /// Handle a client acknowledgement, returning false when the session must end.
    async fn handle_ack(&mut self, req: DiscoveryRequest) -> bool {
        let version = match req.last_seen {
            Some(version) => version,
            None => return true,
        };
        // The ack sequence must stay behind the stream and be monotonic.
        let ahead_of_stream = version.epoch == self.last_sent.version.epoch && version.counter > self.last_sent.version.counter;
        let regressed = self.last_acked.map(|prev| prev.is_newer_than(&version)).unwrap_or(false);
        if ahead_of_stream || regressed {
            tracing::warn!(session = ?self.id, ?version, "protocol violation in discovery acknowledgement");
            let _res = self
                .tx
                .send(Err(Status::invalid_argument("acknowledged version is out of sequence")))
                .await;
            return false;
        }
        self.last_acked = Some(version);
        true
    }
}

/// Compute the delta frame advancing a client from the `old` view to the `new` view.
fn delta(old: &AssignmentView, new: &AssignmentView) -> AssignmentUpdate {
    let mut added = vec![];
    let mut changed = vec![];
    let mut removed = vec![];
    for (name, chan) in &new.channels {
        match old.channels.get(name) {
            None => added.push(chan.clone()),
            Some(prev) if prev != chan => changed.push(chan.clone()),
            Some(_) => {}
        }
    }
    for name in old.channels.keys() {
        if !new.channels.contains_key(name) {
            removed.push(name.clone());
        }
    }
    AssignmentUpdate {
        version: new.version,
        full: false,
        added,
        changed,
        removed,
    }
}
