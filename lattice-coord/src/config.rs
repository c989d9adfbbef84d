//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,
    /// The port on which the Prometheus metrics endpoint is served.
    #[serde(default = "defaults::metrics_port")]
    pub metrics_port: u16,
    /// The name of this cluster, used to scope worker jobs and metrics.
    #[serde(default = "defaults::cluster_name")]
    pub cluster_name: String,

    /// The path to the metadata database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// The filesystem root backing the object store.
    #[serde(default = "defaults::object_store_path")]
    pub object_store_path: String,

    /// The interval in seconds between balancer policy passes.
    #[serde(default = "defaults::balancer_check_interval_seconds")]
    pub balancer_check_interval_seconds: u64,
    /// The relative load threshold above which the balancer will move channels.
    #[serde(default = "defaults::balancer_rebalance_threshold")]
    pub balancer_rebalance_threshold: f64,
    /// The name of the channel balance policy to use.
    #[serde(default = "defaults::balancer_policy")]
    pub balancer_policy: String,

    /// The interval in seconds between scheduler dispatch & polling passes.
    #[serde(default = "defaults::scheduler_interval_seconds")]
    pub scheduler_interval_seconds: u64,
    /// Queue or run time in seconds past which a task is reported as slow.
    #[serde(default = "defaults::scheduler_slow_threshold_seconds")]
    pub scheduler_slow_threshold_seconds: u64,
    /// The max number of concurrently in-flight task result polls.
    #[serde(default = "defaults::scheduler_poll_concurrency")]
    pub scheduler_poll_concurrency: usize,

    /// A bool indicating if garbage collection is enabled.
    #[serde(default = "defaults::gc_enabled")]
    pub gc_enabled: bool,
    /// The interval in seconds between metadata & index GC passes.
    #[serde(default = "defaults::gc_check_interval_seconds")]
    pub gc_check_interval_seconds: u64,
    /// The interval in seconds between object store residue scans.
    #[serde(default = "defaults::gc_scan_interval_seconds")]
    pub gc_scan_interval_seconds: u64,
    /// The minimum age in seconds of an unreferenced object before it may be reclaimed.
    #[serde(default = "defaults::gc_missing_tolerance_seconds")]
    pub gc_missing_tolerance_seconds: u64,
    /// The minimum age in seconds of a dropped segment before its files may be reclaimed.
    #[serde(default = "defaults::gc_drop_tolerance_seconds")]
    pub gc_drop_tolerance_seconds: u64,
    /// The parallelism of per-file deletes during GC.
    #[serde(default = "defaults::gc_remove_concurrency")]
    pub gc_remove_concurrency: usize,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// The interval between balancer policy passes.
    pub fn balancer_check_interval(&self) -> Duration {
        Duration::from_secs(self.balancer_check_interval_seconds)
    }

    /// The interval between scheduler dispatch & polling passes.
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_seconds)
    }

    /// Queue or run time past which a task is reported as slow.
    pub fn scheduler_slow_threshold(&self) -> Duration {
        Duration::from_secs(self.scheduler_slow_threshold_seconds)
    }

    /// The interval between metadata & index GC passes.
    pub fn gc_check_interval(&self) -> Duration {
        Duration::from_secs(self.gc_check_interval_seconds)
    }

    /// The interval between object store residue scans.
    pub fn gc_scan_interval(&self) -> Duration {
        Duration::from_secs(self.gc_scan_interval_seconds)
    }

    /// The minimum age of an unreferenced object before it may be reclaimed.
    pub fn gc_missing_tolerance(&self) -> Duration {
        Duration::from_secs(self.gc_missing_tolerance_seconds)
    }

    /// The minimum age of a dropped segment before its files may be reclaimed.
    pub fn gc_drop_tolerance(&self) -> Duration {
        Duration::from_secs(self.gc_drop_tolerance_seconds)
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        Ok((
            std::sync::Arc::new(Self {
                rust_log: "".into(),
                metrics_port: 9000,
                cluster_name: "testing".into(),

                storage_data_path: tmpdir.path().join("db").to_string_lossy().to_string(),
                object_store_path: tmpdir.path().join("objects").to_string_lossy().to_string(),

                balancer_check_interval_seconds: defaults::balancer_check_interval_seconds(),
                balancer_rebalance_threshold: defaults::balancer_rebalance_threshold(),
                balancer_policy: defaults::balancer_policy(),

                scheduler_interval_seconds: defaults::scheduler_interval_seconds(),
                scheduler_slow_threshold_seconds: defaults::scheduler_slow_threshold_seconds(),
                scheduler_poll_concurrency: defaults::scheduler_poll_concurrency(),

                gc_enabled: true,
                gc_check_interval_seconds: defaults::gc_check_interval_seconds(),
                gc_scan_interval_seconds: defaults::gc_scan_interval_seconds(),
                gc_missing_tolerance_seconds: defaults::gc_missing_tolerance_seconds(),
                gc_drop_tolerance_seconds: defaults::gc_drop_tolerance_seconds(),
                gc_remove_concurrency: defaults::gc_remove_concurrency(),
            }),
            tmpdir,
        ))
    }
}

mod defaults {
    pub(super) fn metrics_port() -> u16 {
        9090
    }
    pub(super) fn cluster_name() -> String {
        "lattice".into()
    }
    pub(super) fn object_store_path() -> String {
        "/usr/local/lattice/objects".into()
    }
    pub(super) fn balancer_check_interval_seconds() -> u64 {
        10
    }
    pub(super) fn balancer_rebalance_threshold() -> f64 {
        0.2
    }
    pub(super) fn balancer_policy() -> String {
        crate::balancer::POLICY_VCHANNEL_FAIR.into()
    }
    pub(super) fn scheduler_interval_seconds() -> u64 {
        1
    }
    pub(super) fn scheduler_slow_threshold_seconds() -> u64 {
        30
    }
    pub(super) fn scheduler_poll_concurrency() -> usize {
        100
    }
    pub(super) fn gc_enabled() -> bool {
        true
    }
    pub(super) fn gc_check_interval_seconds() -> u64 {
        60 * 60
    }
    pub(super) fn gc_scan_interval_seconds() -> u64 {
        60 * 60 * 24
    }
    pub(super) fn gc_missing_tolerance_seconds() -> u64 {
        60 * 60
    }
    pub(super) fn gc_drop_tolerance_seconds() -> u64 {
        60 * 60 * 3
    }
    pub(super) fn gc_remove_concurrency() -> usize {
        32
    }
}
