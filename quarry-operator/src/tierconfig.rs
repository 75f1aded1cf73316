//! Resolution of a tier's externally managed properties file.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;

use crate::k8s::client::ClusterClient;
use quarry_core::crd::ConfigMapReference;
use quarry_core::Result;

/// The value of `run_mode` which places the cluster in shared-storage mode.
const RUN_MODE_SHARED_DATA: &str = "shared_data";

/// The parsed properties of one tier.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TierConfig {
    values: BTreeMap<String, String>,
}

impl TierConfig {
    /// Parse a properties file of `key = value` lines. Comments & blank lines are skipped.
    pub fn parse(raw: &str) -> Self {
        let values = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
            .filter_map(|line| line.split_once(|c: char| c == '=' || c == ':'))
            .map(|(key, val)| (key.trim().to_string(), val.trim().to_string()))
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Read a port value, falling back to the given default when absent or unparsable.
    pub fn port(&self, key: &str, default: i32) -> i32 {
        self.get(key).and_then(|val| val.parse().ok()).unwrap_or(default)
    }

    /// Check if the cluster runs in shared-storage mode.
    pub fn is_shared_data(&self) -> bool {
        self.get("run_mode").map(|mode| mode == RUN_MODE_SHARED_DATA).unwrap_or(false)
    }
}

/// Read & parse the referenced ConfigMap key. A missing reference, ConfigMap or key yields an
/// empty config, so defaults apply.
#[tracing::instrument(level = "debug", skip(client, reference))]
pub async fn resolve<C: ClusterClient>(client: &C, namespace: &str, reference: Option<&ConfigMapReference>) -> Result<TierConfig> {
    let Some(reference) = reference else {
        return Ok(TierConfig::default());
    };
    let config_map: Option<ConfigMap> = client.get(namespace, &reference.config_map_name).await?;
    let raw = config_map
        .and_then(|config_map| config_map.data)
        .and_then(|mut data| data.remove(&reference.resolve_key));
    match raw {
        Some(raw) => Ok(TierConfig::parse(&raw)),
        None => {
            tracing::debug!(config_map = %reference.config_map_name, key = %reference.resolve_key, "tier config not found, using defaults");
            Ok(TierConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_properties_and_ports() {
        let config = TierConfig::parse(
            "# frontend config\n\
             query_port = 19030\n\
             http_port=18030\n\
             \n\
             run_mode = shared_data\n\
             bogus_port = abc\n",
        );
        assert_eq!(config.port("query_port", 9030), 19030);
        assert_eq!(config.port("http_port", 8030), 18030);
        assert_eq!(config.port("bogus_port", 1), 1);
        assert_eq!(config.port("rpc_port", 9020), 9020);
        assert!(config.is_shared_data(), "expected shared_data run mode to be detected");
        assert!(!TierConfig::default().is_shared_data(), "expected empty config to be shared_nothing");
    }
}
