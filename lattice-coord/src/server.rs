//! The coordinator's HTTP monitoring endpoints.

use anyhow::Result;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::get_metrics_recorder;

/// The HTTP server exposing the coordinator's metrics scrape & liveness endpoints.
pub struct MonitorServer {
    /// Shared handler state.
    state: MonitorState,
    /// The port to serve on.
    port: u16,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Receiver<()>,
}

/// State shared with the monitoring handlers.
#[derive(Clone)]
struct MonitorState {
    /// The scrape handle of the global Prometheus recorder.
    scrape: PrometheusHandle,
    /// The cluster name stamped onto every response.
    cluster: String,
}

impl MonitorServer {
    /// Create a new instance over the global metrics recorder.
    pub fn new(config: &Config, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            state: MonitorState {
                scrape: get_metrics_recorder(config).handle(),
                cluster: config.cluster_name.clone(),
            },
            port: config.metrics_port,
            shutdown,
        }
    }

    /// Spawn the server, which serves until graceful shutdown is triggered.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        let Self { state, port, mut shutdown } = self;
        let app = Router::new()
            .route("/metrics", get(scrape_metrics))
            .route("/healthz", get(healthz))
            .layer(AddExtensionLayer::new(state));
        let server = axum::Server::bind(&([0, 0, 0, 0], port).into())
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move {
                let _res = shutdown.recv().await;
            });
        tracing::info!("monitoring server is listening at 0.0.0.0:{}/metrics", port);
        tokio::spawn(server.map_err(anyhow::Error::from))
    }
}

/// Serve a Prometheus scrape of the coordinator's metrics.
async fn scrape_metrics(Extension(state): Extension<MonitorState>) -> (StatusCode, HeaderMap, String) {
    (StatusCode::OK, monitor_headers(&state.cluster, "text/plain; version=0.0.4"), state.scrape.render())
}

/// Serve a trivial liveness probe.
///
/// Liveness only: readiness of the coordinator is governed by its session lease, not by HTTP.
async fn healthz(Extension(state): Extension<MonitorState>) -> (StatusCode, HeaderMap, &'static str) {
    (StatusCode::OK, monitor_headers(&state.cluster, "text/plain"), "ok")
}

/// Build the response headers stamped onto every monitoring response.
fn monitor_headers(cluster: &str, content_type: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(cluster) {
        headers.insert(HeaderName::from_static("x-lattice-cluster"), value);
    }
    headers
}
