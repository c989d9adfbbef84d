//! Channel balancer.
//!
//! The balancer is the single owner of all physical channel metadata. Every mutation flows
//! through its control loop, is made durable through the metadata store gateway before it is
//! exposed, and results in exactly one version bump covering the whole batch. Subscribers
//! receive immutable snapshot copies; nothing holds a reference back into the balancer.

mod policy;
#[cfg(test)]
mod policy_test;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, WatchStream};

use crate::config::Config;
use crate::error::AppError;
use crate::metastore::MetaStore;
use crate::models::{AccessMode, AssignmentHistory, ChannelState, PChannelMeta};
use crate::registry::WorkerRegistry;
use crate::utils;

pub use policy::{policy_for, BalancePolicy, VChannelFairPolicy, POLICY_VCHANNEL_FAIR};

const METRIC_ASSIGNMENT_VERSION: &str = "lattice_coord_assignment_version";
const METRIC_CHANNELS: &str = "lattice_coord_channels";

/// The max number of prior assignments retained per channel.
const HISTORY_LIMIT: usize = 10;
/// The capacity of the assignment updates broadcast channel.
const UPDATES_CAPACITY: usize = 64;

/// A version pair identifying an assignment view.
///
/// `epoch` identifies the coordinator incarnation; `counter` advances on every mutation batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewVersion {
    pub epoch: i64,
    pub counter: u64,
}

impl ViewVersion {
    /// Check if this version strictly supersedes the given version.
    pub fn is_newer_than(&self, other: &ViewVersion) -> bool {
        self.epoch != other.epoch || self.counter > other.counter
    }
}

/// A single channel's entry within an assignment view.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelAssignment {
    /// The name of the channel.
    pub name: String,
    /// The node holding the assignment.
    pub node_id: i64,
    /// The channel's current term.
    pub term: i64,
    /// The channel's access mode.
    pub access_mode: AccessMode,
    /// The channel's assignment state.
    pub state: ChannelState,
}

/// An immutable snapshot of the channel to node assignment map.
///
/// Channels which are unavailable are excluded; subscribers observe their retirement as a
/// removal delta.
#[derive(Clone, Debug, Default)]
pub struct AssignmentView {
    /// The version pair of this view.
    pub version: ViewVersion,
    /// All live channel assignments, keyed by channel name.
    pub channels: BTreeMap<String, ChannelAssignment>,
}

/// A message bound for the channel balancer.
pub enum BalancerCtlMsg {
    /// Declare the given `(channel, vchannel_count)` pairs, creating records on first observation.
    DeclareChannels {
        channels: Vec<(String, u32)>,
        tx: oneshot::Sender<Result<()>>,
    },
    /// Apply the given `channel -> (access_mode, node)` updates as a single batch.
    Assign {
        updates: HashMap<String, (AccessMode, i64)>,
        tx: oneshot::Sender<Result<()>>,
    },
    /// Acknowledge that the target node has taken ownership of the channel.
    Confirm {
        channel: String,
        tx: oneshot::Sender<Result<()>>,
    },
    /// Take the given channels out of service.
    MarkUnavailable {
        channels: Vec<String>,
        tx: oneshot::Sender<Result<()>>,
    },
    /// Force a balance pass.
    Trigger,
    /// Persist the one-time streaming-enabled marker.
    EnableStreaming { tx: oneshot::Sender<Result<()>> },
    /// Register a notifier resolved once streaming is enabled.
    StreamingNotifier { tx: oneshot::Sender<()> },
}

/// A live handle to the channel balancer.
#[derive(Clone)]
pub struct BalancerHandle {
    requests: mpsc::Sender<BalancerCtlMsg>,
    view: watch::Receiver<Arc<AssignmentView>>,
    updates: broadcast::Sender<Arc<AssignmentView>>,
}

impl BalancerHandle {
    /// The current assignment view.
    pub fn current_view(&self) -> Arc<AssignmentView> {
        self.view.borrow().clone()
    }

    /// Locate the node currently responsible for the target channel.
    ///
    /// The returned bool is true only once the assignment has been confirmed.
    pub fn locate(&self, channel: &str) -> Option<(i64, bool)> {
        self.view
            .borrow()
            .channels
            .get(channel)
            .map(|chan| (chan.node_id, chan.state == ChannelState::Assigned))
    }

    /// Subscribe to assignment updates, returning the current view and the update stream.
    pub fn subscribe(&self) -> (Arc<AssignmentView>, broadcast::Receiver<Arc<AssignmentView>>) {
        let updates = self.updates.subscribe();
        (self.current_view(), updates)
    }

    /// Invoke the given callback with the current view and then again on every version bump,
    /// until the callback errors, the balancer shuts down, or the callback's error is returned.
    pub async fn watch<F, Fut>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(Arc<AssignmentView>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let (initial, mut updates) = self.subscribe();
        let mut last = initial.version;
        callback(initial).await?;
        loop {
            match updates.recv().await {
                Ok(view) => {
                    if !view.version.is_newer_than(&last) {
                        continue;
                    }
                    last = view.version;
                    callback(view).await?;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let view = self.current_view();
                    if view.version.is_newer_than(&last) {
                        last = view.version;
                        callback(view).await?;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Declare the given `(channel, vchannel_count)` pairs.
    pub async fn declare_channels(&self, channels: Vec<(String, u32)>) -> Result<()> {
        self.request(|tx| BalancerCtlMsg::DeclareChannels { channels, tx }).await
    }

    /// Apply the given assignment updates as a single batch.
    pub async fn assign(&self, updates: HashMap<String, (AccessMode, i64)>) -> Result<()> {
        self.request(|tx| BalancerCtlMsg::Assign { updates, tx }).await
    }

    /// Acknowledge that the target node has taken ownership of the channel.
    pub async fn confirm(&self, channel: &str) -> Result<()> {
        let channel = channel.to_string();
        self.request(|tx| BalancerCtlMsg::Confirm { channel, tx }).await
    }

    /// Take the given channels out of service.
    pub async fn mark_unavailable(&self, channels: Vec<String>) -> Result<()> {
        self.request(|tx| BalancerCtlMsg::MarkUnavailable { channels, tx }).await
    }

    /// Force a balance pass.
    pub async fn trigger(&self) -> Result<()> {
        self.requests
            .send(BalancerCtlMsg::Trigger)
            .await
            .map_err(|_err| anyhow!("channel balancer has shutdown"))
    }

    /// Persist the one-time streaming-enabled marker, resolving all pending notifiers.
    pub async fn enable_streaming(&self) -> Result<()> {
        self.request(|tx| BalancerCtlMsg::EnableStreaming { tx }).await
    }

    /// Register a notifier which resolves once streaming is enabled.
    ///
    /// Notifiers registered after the marker has been persisted resolve immediately.
    pub async fn streaming_enabled_notifier(&self) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(BalancerCtlMsg::StreamingNotifier { tx })
            .await
            .map_err(|_err| anyhow!("channel balancer has shutdown"))?;
        Ok(rx)
    }

    async fn request<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> BalancerCtlMsg,
    {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_err| anyhow!("channel balancer has shutdown"))?;
        rx.await.context("error awaiting channel balancer response")?
    }
}

/// A controller encapsulating all logic for balancing physical channels over streaming nodes.
pub struct ChannelBalancer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The metadata store gateway.
    meta: MetaStore,

    /// All known channel metadata, owned exclusively by this controller.
    channels: BTreeMap<String, PChannelMeta>,
    /// The active balance policy.
    policy: Box<dyn BalancePolicy>,
    /// The current streaming node membership set.
    nodes: Vec<i64>,
    /// The version pair of the most recently published view.
    version: ViewVersion,
    /// A bool indicating if the streaming-enabled marker has been persisted.
    streaming_enabled: bool,
    /// Notifiers awaiting the streaming-enabled edge.
    notifiers: Vec<oneshot::Sender<()>>,

    /// The latest-view publication channel.
    view_tx: watch::Sender<Arc<AssignmentView>>,
    /// The per-version updates channel.
    updates_tx: broadcast::Sender<Arc<AssignmentView>>,
    /// A channel of inbound control requests.
    requests_rx: ReceiverStream<BalancerCtlMsg>,
    /// A stream of registry membership updates.
    membership: WatchStream<Vec<i64>>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ChannelBalancer {
    /// Create a new instance, recovering all channel state from the metadata store.
    pub async fn new(
        config: Arc<Config>, meta: MetaStore, registry: &WorkerRegistry, shutdown: broadcast::Receiver<()>,
    ) -> Result<(Self, BalancerHandle)> {
        let policy = policy_for(&config.balancer_policy, config.balancer_rebalance_threshold)?;
        metrics::register_counter!(METRIC_ASSIGNMENT_VERSION, metrics::Unit::Count, "assignment view version bumps");
        metrics::register_gauge!(METRIC_CHANNELS, metrics::Unit::Count, "number of known physical channels");

        // Recover persisted channel state.
        let streaming_enabled = meta.get_streaming_version().await?.is_some();
        let mut channels = BTreeMap::new();
        for mut chan in meta.list_pchannels().await? {
            // The streaming-enabled marker flips read-only channels to read-write on recovery.
            if streaming_enabled && chan.channel_access_mode() == AccessMode::ReadOnly {
                chan.access_mode = AccessMode::ReadWrite as i32;
                meta.put_pchannel(&chan).await?;
            }
            channels.insert(chan.name.clone(), chan);
        }
        tracing::info!(channels = channels.len(), streaming_enabled, "channel balancer recovered from metadata");

        let version = ViewVersion {
            epoch: utils::now_timestamp(),
            counter: 0,
        };
        let view = Arc::new(snapshot_view(version, &channels));
        let (view_tx, view_rx) = watch::channel(view);
        let (updates_tx, _) = broadcast::channel(UPDATES_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel(100);
        let handle = BalancerHandle {
            requests: requests_tx,
            view: view_rx,
            updates: updates_tx.clone(),
        };
        Ok((
            Self {
                config,
                meta,
                channels,
                policy,
                nodes: vec![],
                version,
                streaming_enabled,
                notifiers: vec![],
                view_tx,
                updates_tx,
                requests_rx: ReceiverStream::new(requests_rx),
                membership: WatchStream::new(registry.membership()),
                shutdown_rx: BroadcastStream::new(shutdown),
            },
            handle,
        ))
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(policy = self.policy.name(), "channel balancer has started");
        let mut check_interval = tokio::time::interval(self.config.balancer_check_interval());

        loop {
            tokio::select! {
                Some(msg) = self.requests_rx.next() => self.handle_ctl_msg(msg).await,
                Some(nodes) = self.membership.next() => self.handle_membership_update(nodes).await,
                _ = check_interval.tick() => self.balance_pass().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("channel balancer has shutdown");
        Ok(())
    }

    /// Handle a balancer control message.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_ctl_msg(&mut self, msg: BalancerCtlMsg) {
        match msg {
            BalancerCtlMsg::DeclareChannels { channels, tx } => {
                let res = self.declare_channels(channels).await;
                let _res = tx.send(res);
            }
            BalancerCtlMsg::Assign { updates, tx } => {
                let res = self.apply_assign(updates).await;
                let _res = tx.send(res);
            }
            BalancerCtlMsg::Confirm { channel, tx } => {
                let res = self.confirm(&channel).await;
                let _res = tx.send(res);
            }
            BalancerCtlMsg::MarkUnavailable { channels, tx } => {
                let res = self.mark_unavailable(channels).await;
                let _res = tx.send(res);
                // Unavailability is a rebalance trigger: surviving channels may be re-created.
                self.balance_pass().await;
            }
            BalancerCtlMsg::Trigger => self.balance_pass().await,
            BalancerCtlMsg::EnableStreaming { tx } => {
                let res = self.enable_streaming().await;
                let _res = tx.send(res);
            }
            BalancerCtlMsg::StreamingNotifier { tx } => {
                if self.streaming_enabled {
                    let _res = tx.send(());
                } else {
                    self.notifiers.push(tx);
                }
            }
        }
    }

    /// Handle an update of the streaming node membership set.
    #[tracing::instrument(level = "debug", skip(self, nodes))]
    async fn handle_membership_update(&mut self, nodes: Vec<i64>) {
        self.nodes = nodes;
        self.balance_pass().await;
    }

    /// Consult the policy and apply any resulting layout changes.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn balance_pass(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        let mut desired = self.policy.rebalance(&self.channels, &self.nodes);
        // Once streaming is enabled, every fresh assignment is made read-write.
        if self.streaming_enabled {
            for (_, entry) in desired.iter_mut() {
                entry.0 = AccessMode::ReadWrite;
            }
        }
        let batch: HashMap<String, (AccessMode, i64)> = desired
            .into_iter()
            .filter(|(name, (mode, node))| !self.is_noop_assignment(name, *mode, *node))
            .collect();
        if batch.is_empty() {
            return;
        }
        tracing::debug!(updates = batch.len(), "balance pass produced assignment updates");
        if let Err(err) = self.apply_assign(batch).await {
            tracing::error!(error = ?err, "error applying balance pass assignments");
        }
    }

    /// Check if the given assignment would not change the channel.
    fn is_noop_assignment(&self, name: &str, mode: AccessMode, node: i64) -> bool {
        match self.channels.get(name) {
            Some(cur) => {
                let state = cur.channel_state();
                (state == ChannelState::Assigned || state == ChannelState::Assigning)
                    && cur.node_id == node
                    && cur.channel_access_mode() == mode
            }
            None => false,
        }
    }

    /// Create records for newly observed channels and update vchannel counts.
    #[tracing::instrument(level = "debug", skip(self, declared))]
    async fn declare_channels(&mut self, declared: Vec<(String, u32)>) -> Result<()> {
        let mut last_err = None;
        let mut changed = false;
        for (name, vchannel_count) in declared {
            let next = match self.channels.get(&name) {
                Some(cur) if cur.vchannel_count == vchannel_count => continue,
                Some(cur) => {
                    let mut next = cur.clone();
                    next.vchannel_count = vchannel_count;
                    next
                }
                None => PChannelMeta {
                    name: name.clone(),
                    term: 0,
                    access_mode: if self.streaming_enabled { AccessMode::ReadWrite as i32 } else { AccessMode::ReadOnly as i32 },
                    node_id: -1,
                    state: ChannelState::Uninitialized as i32,
                    vchannel_count,
                    ..Default::default()
                },
            };
            match self.meta.put_pchannel(&next).await {
                Ok(()) => {
                    self.channels.insert(name, next);
                    changed = true;
                }
                Err(err) => {
                    tracing::error!(error = ?err, channel = %name, "error persisting declared channel");
                    last_err = Some(err);
                }
            }
        }
        if changed {
            metrics::gauge!(METRIC_CHANNELS, self.channels.len() as f64);
            self.balance_pass().await;
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Apply the given assignment updates as a single batch.
    ///
    /// Entries matching the channel's current in-flight or confirmed assignment are skipped, so
    /// re-applying a batch is a no-op. A persistence failure leaves the in-memory state of that
    /// channel unchanged while already persisted siblings remain applied; watchers observe a
    /// single version bump once all successful persists are in place.
    #[tracing::instrument(level = "debug", skip(self, updates))]
    async fn apply_assign(&mut self, updates: HashMap<String, (AccessMode, i64)>) -> Result<()> {
        let mut updates: Vec<(String, (AccessMode, i64))> = updates.into_iter().collect();
        updates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut applied = false;
        let mut last_err = None;
        for (name, (mode, node)) in updates {
            if self.is_noop_assignment(&name, mode, node) {
                continue;
            }
            let mut next = match self.channels.get(&name) {
                Some(cur) => cur.clone(),
                None => PChannelMeta {
                    name: name.clone(),
                    node_id: -1,
                    vchannel_count: 1,
                    ..Default::default()
                },
            };
            if next.term > 0 {
                next.histories.push(AssignmentHistory {
                    term: next.term,
                    node_id: next.node_id,
                    access_mode: next.access_mode,
                });
                if next.histories.len() > HISTORY_LIMIT {
                    let excess = next.histories.len() - HISTORY_LIMIT;
                    next.histories.drain(..excess);
                }
            }
            next.term += 1;
            next.node_id = node;
            next.access_mode = mode as i32;
            next.state = ChannelState::Assigning as i32;
            next.last_assign_timestamp = utils::now_timestamp();
            match self.meta.put_pchannel(&next).await {
                Ok(()) => {
                    tracing::info!(channel = %name, node, term = next.term, "channel assignment persisted");
                    self.channels.insert(name, next);
                    applied = true;
                }
                Err(err) => {
                    tracing::error!(error = ?err, channel = %name, "error persisting channel assignment, leaving channel unchanged");
                    last_err = Some(err);
                }
            }
        }
        if applied {
            self.publish();
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Finalize an in-flight assignment after the target node has acknowledged ownership.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn confirm(&mut self, channel: &str) -> Result<()> {
        let cur = match self.channels.get(channel) {
            Some(cur) => cur,
            None => return Err(AppError::ResourceNotFound.into()),
        };
        if cur.channel_state() != ChannelState::Assigning {
            return Err(AppError::InvalidInput(format!("channel `{}` is not awaiting assignment confirmation", channel)).into());
        }
        let mut next = cur.clone();
        next.state = ChannelState::Assigned as i32;
        next.histories.clear();
        next.last_assign_timestamp = utils::now_timestamp();
        self.meta.put_pchannel(&next).await?;
        tracing::info!(channel = %channel, node = next.node_id, term = next.term, "channel assignment confirmed");
        self.channels.insert(channel.to_string(), next);
        self.publish();
        Ok(())
    }

    /// Take the given channels out of service.
    #[tracing::instrument(level = "debug", skip(self, names))]
    async fn mark_unavailable(&mut self, names: Vec<String>) -> Result<()> {
        let mut applied = false;
        let mut last_err = None;
        for name in names {
            let cur = match self.channels.get(&name) {
                Some(cur) => cur,
                None => continue,
            };
            if cur.channel_state() == ChannelState::Unavailable {
                continue;
            }
            let mut next = cur.clone();
            next.state = ChannelState::Unavailable as i32;
            next.last_assign_timestamp = utils::now_timestamp();
            match self.meta.put_pchannel(&next).await {
                Ok(()) => {
                    tracing::info!(channel = %name, "channel marked unavailable");
                    self.channels.insert(name, next);
                    applied = true;
                }
                Err(err) => {
                    tracing::error!(error = ?err, channel = %name, "error persisting channel unavailability");
                    last_err = Some(err);
                }
            }
        }
        if applied {
            self.publish();
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Persist the one-time streaming-enabled marker and resolve all pending notifiers.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn enable_streaming(&mut self) -> Result<()> {
        if !self.streaming_enabled {
            self.meta.put_streaming_version(1).await?;
            self.streaming_enabled = true;
            tracing::info!("streaming-enabled marker persisted");
        }
        for tx in self.notifiers.drain(..) {
            let _res = tx.send(());
        }
        Ok(())
    }

    /// Bump the view version and publish a fresh snapshot to all subscribers.
    fn publish(&mut self) {
        self.version.counter += 1;
        let view = Arc::new(snapshot_view(self.version, &self.channels));
        metrics::increment_counter!(METRIC_ASSIGNMENT_VERSION);
        metrics::gauge!(METRIC_CHANNELS, self.channels.len() as f64);
        let _res = self.view_tx.send(view.clone());
        let _res = self.updates_tx.send(view);
    }
}

/// Build an assignment view over the given channel map.
fn snapshot_view(version: ViewVersion, channels: &BTreeMap<String, PChannelMeta>) -> AssignmentView {
    let channels = channels
        .values()
        .filter(|meta| matches!(meta.channel_state(), ChannelState::Assigning | ChannelState::Assigned))
        .map(|meta| {
            (
                meta.name.clone(),
                ChannelAssignment {
                    name: meta.name.clone(),
                    node_id: meta.node_id,
                    term: meta.term,
                    access_mode: meta.channel_access_mode(),
                    state: meta.channel_state(),
                },
            )
        })
        .collect();
    AssignmentView { version, channels }
}
