//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The port used for HTTP healthchecks & metrics.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace in which this operator is running.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,
    /// Restrict the operator to clusters of a single namespace.
    #[serde(default)]
    pub watch_namespace: Option<String>,
    /// Namespaces whose clusters are never reconciled, given as a comma-separated list.
    #[serde(default)]
    pub denied_namespaces: Vec<String>,

    /// The duration in seconds for which a lease is considered held.
    #[serde(default = "Config::default_lease_duration_seconds")]
    pub lease_duration_seconds: u32,
    /// The duration that a lease holder will retry refreshing lease.
    #[serde(default = "Config::default_lease_renew_seconds")]
    pub lease_renew_seconds: u32,

    /// The user used on the administrative channel of the frontend tier.
    #[serde(default = "Config::default_admin_user")]
    pub admin_user: String,
    /// The password used on the administrative channel of the frontend tier.
    #[serde(default)]
    pub admin_password: String,
    /// The default administrative port of the frontend tier.
    #[serde(default = "Config::default_admin_port")]
    pub admin_port: u16,

    /// The default timeout of a single upgrade hook.
    #[serde(default = "Config::default_hook_timeout_seconds")]
    pub hook_timeout_seconds: u64,
    /// Environment variables passed through to script hooks, given as a comma-separated list.
    #[serde(default = "Config::default_hook_env_allowlist")]
    pub hook_env_allowlist: Vec<String>,

    /// The number of attempts made for a write which hits an optimistic concurrency conflict.
    #[serde(default = "Config::default_conflict_retry_attempts")]
    pub conflict_retry_attempts: u32,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the relationships between config values.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.lease_duration_seconds > self.lease_renew_seconds,
            "LEASE_DURATION_SECONDS must be greater than LEASE_RENEW_SECONDS"
        );
        ensure!(self.lease_renew_seconds >= 1, "LEASE_RENEW_SECONDS must be at least 1");
        ensure!(self.hook_timeout_seconds >= 1, "HOOK_TIMEOUT_SECONDS must be at least 1");
        ensure!(self.conflict_retry_attempts >= 1, "CONFLICT_RETRY_ATTEMPTS must be at least 1");
        Ok(())
    }

    /// Check if clusters of the given namespace may be reconciled.
    pub fn is_namespace_allowed(&self, namespace: &str) -> bool {
        if let Some(watched) = self.watch_namespace.as_deref() {
            if watched != namespace {
                return false;
            }
        }
        !self.denied_namespaces.iter().any(|denied| denied == namespace)
    }

    /// The default per-hook timeout.
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_seconds)
    }

    /// Build a config instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Result<std::sync::Arc<Self>> {
        let config: Config = envy::from_iter(vec![
            ("NAMESPACE".to_string(), "quarry-system".to_string()),
            ("POD_NAME".to_string(), "quarry-operator-0".to_string()),
            ("DENIED_NAMESPACES".to_string(), "kube-system".to_string()),
        ])
        .context("error building test config")?;
        config.validate()?;
        Ok(std::sync::Arc::new(config))
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_lease_duration_seconds() -> u32 {
        15
    }

    fn default_lease_renew_seconds() -> u32 {
        10
    }

    fn default_admin_user() -> String {
        "root".into()
    }

    fn default_admin_port() -> u16 {
        9030
    }

    fn default_hook_timeout_seconds() -> u64 {
        300
    }

    fn default_hook_env_allowlist() -> Vec<String> {
        vec!["PATH".into()]
    }

    fn default_conflict_retry_attempts() -> u32 {
        5
    }
}
