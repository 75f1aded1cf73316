//! The Quarry operator.

mod app;
mod config;
mod fingerprint;
mod hooks;
mod k8s;
mod reconcile;
mod retry;
mod server;
mod templates;
mod tierconfig;

#[cfg(test)]
mod fingerprint_test;
#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod hooks_test;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(Config::new()?);

    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the configured directives.
        .with(tracing_subscriber::EnvFilter::try_new(&cfg.rust_log).context("error parsing logging directives")?)
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let metrics = PrometheusBuilder::new()
        .add_global_label("namespace", cfg.namespace.clone())
        .add_global_label("pod", cfg.pod_name.clone())
        .install_recorder()
        .context("error installing prometheus metrics recorder")?;

    tracing::info!(
        http_port = %cfg.http_port,
        namespace = %cfg.namespace,
        watch_namespace = ?cfg.watch_namespace,
        "starting Quarry operator",
    );
    if let Err(err) = App::new(cfg, metrics).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
