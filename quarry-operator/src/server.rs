//! The HTTP server for healthchecks & metrics.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::get;
use axum::Router;
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Application server.
pub struct AppServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// A handle to the installed metrics recorder.
    metrics: PrometheusHandle,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, metrics: PrometheusHandle, shutdown: broadcast::Sender<()>) -> Self {
        Self { config, metrics, shutdown }
    }

    /// Spawn the HTTP server. An error from the server triggers shutdown of the application.
    pub fn spawn(self) -> JoinHandle<()> {
        let router = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/metrics", get(prom_metrics))
            .layer(Extension(self.metrics));
        let mut shutdown_rx = self.shutdown.subscribe();
        let server = axum::Server::bind(&([0, 0, 0, 0], self.config.http_port).into())
            .serve(router.into_make_service())
            .with_graceful_shutdown(async move {
                let _res = shutdown_rx.recv().await;
            });
        tracing::info!("http server is listening at 0.0.0.0:{}", self.config.http_port);

        let shutdown = self.shutdown;
        tokio::spawn(server.map(move |res| {
            if let Err(err) = res {
                tracing::error!(error = ?err, "error from http server, shutting down");
                let _res = shutdown.send(());
            }
        }))
    }
}

/// Handler for serving Prometheus metrics.
async fn prom_metrics(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}
