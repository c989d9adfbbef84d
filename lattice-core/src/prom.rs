//! Process metrics for Lattice services.
//!
//! Every Lattice binary installs a global Prometheus recorder at startup; this module registers
//! and samples the process-level gauges shared across them. Sampling reads procfs and is only
//! available on Linux behind the `prom` feature; on other targets the sampler is inert and the
//! registered gauges simply never move.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

pub const METRIC_OPEN_FDS: &str = "process_open_fds";
pub const METRIC_VIRTUAL_MEMORY_BYTES: &str = "process_virtual_memory_bytes";
pub const METRIC_RESIDENT_MEMORY_BYTES: &str = "process_resident_memory_bytes";
pub const METRIC_THREADS: &str = "process_threads";

/// The cadence at which process metrics are sampled.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Register the process metrics sampled by this module.
///
/// This function should be called only once, early in the lifetime of the process.
pub fn register_proc_metrics() {
    metrics::register_gauge!(METRIC_OPEN_FDS, metrics::Unit::Count, "Number of open file descriptors.");
    metrics::register_gauge!(METRIC_VIRTUAL_MEMORY_BYTES, metrics::Unit::Bytes, "Virtual memory size in bytes.");
    metrics::register_gauge!(METRIC_RESIDENT_MEMORY_BYTES, metrics::Unit::Bytes, "Resident memory size in bytes.");
    metrics::register_gauge!(METRIC_THREADS, metrics::Unit::Count, "Number of OS threads in the process.");
}

/// Collect a sample of process metrics.
#[cfg(not(feature = "prom"))]
pub fn collect_proc_metrics() -> Result<()> {
    anyhow::bail!("process metrics sampling requires the `prom` feature (Linux only)")
}

/// Collect a sample of process metrics.
#[cfg(feature = "prom")]
pub fn collect_proc_metrics() -> Result<()> {
    use anyhow::Context;
    let proc = procfs::process::Process::myself().context("error reading process info from procfs")?;

    match proc.fd_count() {
        Ok(open_fds) => metrics::gauge!(METRIC_OPEN_FDS, open_fds as f64),
        Err(err) => tracing::error!(error = ?err, "error sampling metric {}", METRIC_OPEN_FDS),
    }
    metrics::gauge!(METRIC_VIRTUAL_MEMORY_BYTES, proc.stat.vsize as f64);
    match proc.stat.rss_bytes() {
        Ok(rss) => metrics::gauge!(METRIC_RESIDENT_MEMORY_BYTES, rss as f64),
        Err(err) => tracing::error!(error = ?err, "error sampling metric {}", METRIC_RESIDENT_MEMORY_BYTES),
    }
    metrics::gauge!(METRIC_THREADS, proc.stat.num_threads as f64);
    Ok(())
}

/// Spawn a process metrics sampler which runs until the given `shutdown` future resolves.
pub fn spawn_proc_metrics_sampler(shutdown: impl Future<Output = ()> + Send + 'static) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !cfg!(feature = "prom") {
            // Nothing to sample on this target; park until shutdown so callers can still join.
            shutdown.await;
            return;
        }
        let mut sample_interval = tokio::time::interval(SAMPLE_INTERVAL);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = sample_interval.tick() => {
                    if let Err(err) = collect_proc_metrics() {
                        tracing::error!(error = ?err, "error collecting process metrics sample");
                    }
                }
                _ = &mut shutdown => break,
            }
        }
    })
}
