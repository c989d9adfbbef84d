use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::api::ControlApi;
use crate::balancer::ChannelBalancer;
use crate::config::Config;
use crate::database::Database;
use crate::gc::{GarbageCollector, GcOption};
use crate::metastore::MetaStore;
use crate::registry::{SessionEvent, SessionWatcher};
use crate::scheduler::TaskScheduler;
use crate::server::MonitorServer;
use crate::storage::FsObjectStore;
use lattice_core::prom::spawn_proc_metrics_sampler;

/// The application object for when the coordinator is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The coordinator's exposed control surface.
    _api: ControlApi,
    /// The inbound session event channel handed to the session/lease system.
    _session_tx: mpsc::Sender<SessionEvent>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the session watcher.
    session_watcher_handle: JoinHandle<Result<()>>,
    /// The join handle of the channel balancer.
    balancer_handle: JoinHandle<Result<()>>,
    /// The join handles of the task scheduler's loops.
    scheduler_handles: Vec<JoinHandle<Result<()>>>,
    /// The join handle of the garbage collector.
    gc_handle: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        // Initialize this node's storage & metadata gateway.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let meta = MetaStore::new(&db).await.context("error opening metadata store gateway")?;

        // Spawn the session watcher; the external lease system feeds `session_tx`.
        let (session_tx, session_rx) = mpsc::channel(1000);
        let (session_watcher, registry) = SessionWatcher::new(session_rx, shutdown_tx.subscribe());
        let session_watcher_handle = session_watcher.spawn();

        // Spawn the channel balancer.
        let (balancer, balancer_ctl) = ChannelBalancer::new(config.clone(), meta.clone(), &registry, shutdown_tx.subscribe())
            .await
            .context("error recovering channel balancer")?;
        let balancer_handle = balancer.spawn();

        // Spawn the task scheduler's loops.
        let (scheduler, scheduler_runner) = TaskScheduler::new(config.clone(), meta.clone(), registry.clone(), shutdown_tx.clone())
            .await
            .context("error recovering task scheduler")?;
        let scheduler_handles = scheduler_runner.spawn();

        // Spawn the garbage collector over the object store.
        let store = Arc::new(FsObjectStore::new(config.object_store_path.clone(), config.cluster_name.clone()));
        let (gc, gc_ctl) = GarbageCollector::new(GcOption::from_config(&config), meta, store, shutdown_tx.subscribe());
        let gc_handle = gc.spawn();

        let api = ControlApi::new(config.clone(), balancer_ctl, scheduler, gc_ctl, shutdown_tx.clone());
        let metrics_server = MonitorServer::new(&config, shutdown_tx.subscribe()).spawn();

        Ok(Self {
            _config: config,
            _api: api,
            _session_tx: session_tx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            session_watcher_handle,
            balancer_handle,
            scheduler_handles,
            gc_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        let mut sampler_shutdown = self.shutdown_tx.subscribe();
        let sampler = spawn_proc_metrics_sampler(async move {
            let _res = sampler_shutdown.recv().await;
        });

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("coordinator is shutting down");
        if let Err(err) = self.session_watcher_handle.await.context("error joining session watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down session watcher");
        }
        if let Err(err) = self.balancer_handle.await.context("error joining channel balancer handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down channel balancer");
        }
        for handle in self.scheduler_handles {
            if let Err(err) = handle.await.context("error joining task scheduler handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down task scheduler");
            }
        }
        if let Err(err) = self.gc_handle.await.context("error joining garbage collector handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down garbage collector");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        if let Err(err) = sampler.await {
            tracing::error!(error = ?err, "error joining metrics sampler task");
        }

        tracing::debug!("coordinator shutdown complete");
        Ok(())
    }
}
