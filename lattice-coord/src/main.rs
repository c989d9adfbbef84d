//! The Lattice streaming coordinator.

mod api;
mod app;
mod balancer;
mod config;
mod database;
mod discovery;
mod error;
#[cfg(test)]
mod fixtures;
mod gc;
mod metastore;
mod models;
mod registry;
mod scheduler;
mod server;
mod storage;
mod utils;
#[cfg(test)]
mod utils_test;

use std::io::Write;
use std::mem::MaybeUninit;
use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;
use lattice_core::prom::register_proc_metrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let recorder = get_metrics_recorder(&cfg);
    metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;
    register_proc_metrics();

    tracing::info!(
        cluster_name = %cfg.cluster_name,
        metrics_port = %cfg.metrics_port,
        storage_data_path = %cfg.storage_data_path,
        object_store_path = %cfg.object_store_path,
        balancer_policy = %cfg.balancer_policy,
        gc_enabled = %cfg.gc_enabled,
        "starting Lattice coordinator",
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    if let Err(err) = App::new(cfg, shutdown_tx.clone()).await?.spawn().await {
        tracing::error!(error = ?err);
        let _res = shutdown_tx.send(());
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}

/// Get a handle to the metrics recorder, initializing it as needed.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static mut RECORDER: MaybeUninit<PrometheusRecorder> = MaybeUninit::uninit();
    static ONCE: Once = Once::new();
    unsafe {
        ONCE.call_once(|| {
            RECORDER.write(
                PrometheusBuilder::new()
                    .idle_timeout(metrics_util::MetricKindMask::ALL, Some(std::time::Duration::from_secs(60 * 60)))
                    .add_global_label("cluster", config.cluster_name.clone())
                    .build(),
            );
        });
        RECORDER.assume_init_ref()
    }
}
