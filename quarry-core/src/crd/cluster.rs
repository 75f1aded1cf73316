//! QuarryCluster CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::ClusterStatus;
use crate::tier::TierKind;

pub type QuarryCluster = QuarryClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the QuarryCluster resource.
///
/// Every tier is optional. Removing a tier's spec tears down all objects owned by that tier.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "QuarryClusterCRD",
    status = "ClusterStatus",
    group = "quarry.rs",
    version = "v1",
    kind = "QuarryCluster",
    namespaced,
    derive = "PartialEq",
    shortname = "qc",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Frontend","type":"string","jsonPath":".status.frontend.phase"}"#,
    printcolumn = r#"{"name":"Backend","type":"string","jsonPath":".status.backend.phase"}"#,
    printcolumn = r#"{"name":"Compute","type":"string","jsonPath":".status.compute.phase"}"#,
    printcolumn = r#"{"name":"Upgrade","type":"string","jsonPath":".status.upgradeState.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// The metadata/coordination tier.
    #[serde(default)]
    pub frontend: Option<FrontendSpec>,
    /// The storage tier.
    #[serde(default)]
    pub backend: Option<TierSpec>,
    /// The elastic compute tier.
    #[serde(default)]
    pub compute: Option<ComputeSpec>,
    /// The stateless proxy tier.
    #[serde(default)]
    pub proxy: Option<ProxySpec>,
    /// Hooks to run around image upgrades of the cluster.
    #[serde(default)]
    pub upgrade_policy: Option<UpgradePolicy>,
}

impl ClusterSpec {
    /// The shared portion of the given tier's spec, if that tier is declared.
    pub fn tier(&self, kind: TierKind) -> Option<&TierSpec> {
        match kind {
            TierKind::Frontend => self.frontend.as_ref().map(|spec| &spec.tier),
            TierKind::Backend => self.backend.as_ref(),
            TierKind::Compute => self.compute.as_ref().map(|spec| &spec.tier),
            TierKind::Proxy => self.proxy.as_ref().map(|spec| &spec.tier),
        }
    }

    /// The desired image of every declared tier, keyed by tier short name.
    pub fn desired_images(&self) -> BTreeMap<String, String> {
        TierKind::ALL
            .iter()
            .filter_map(|kind| self.tier(*kind).map(|spec| (kind.short_name().to_string(), spec.image.clone())))
            .collect()
    }
}

/// The portion of a tier's spec shared by all tiers.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TierSpec {
    /// The number of instances of this tier. Left unset, the live value is retained.
    #[serde(default)]
    pub replicas: Option<i32>,
    /// The container image to run.
    pub image: String,
    /// The pull policy for the container image.
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    /// Compute resource requirements of the tier's container.
    #[serde(default)]
    pub resources: Option<TierResources>,
    /// Persistent volumes claimed by each instance.
    #[serde(default)]
    pub storage_volumes: Vec<StorageVolume>,
    /// A reference to the ConfigMap holding the tier's properties file.
    #[serde(default)]
    pub config_map_info: Option<ConfigMapReference>,
    /// Extra ConfigMaps mounted into the tier's container.
    #[serde(default)]
    pub config_maps: Vec<MountInfo>,
    /// Extra Secrets mounted into the tier's container.
    #[serde(default)]
    pub secrets: Vec<MountInfo>,
    /// Extra environment variables for the tier's container.
    #[serde(default)]
    pub env_vars: Vec<EnvVarSpec>,
    /// Settings for the tier's externally reachable service.
    #[serde(default)]
    pub service: Option<ServiceSpec>,
    #[serde(default)]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub service_account: Option<String>,
}

/// Resource requests & limits, using K8s quantity strings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TierResources {
    #[serde(default)]
    pub requests: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub limits: Option<BTreeMap<String, String>>,
}

/// A persistent volume claimed by each instance of a tier.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageVolume {
    pub name: String,
    #[serde(default)]
    pub storage_class_name: Option<String>,
    /// The size of the volume, as a K8s quantity string.
    pub storage_size: String,
    pub mount_path: String,
}

/// A reference to a ConfigMap key holding a tier's properties file.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapReference {
    pub config_map_name: String,
    pub resolve_key: String,
}

/// A ConfigMap or Secret to be mounted into a tier's container.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: Option<String>,
}

/// Settings for a tier's externally reachable service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// One of `ClusterIP`, `NodePort` or `LoadBalancer`.
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSpec {
    pub name: String,
    pub value: String,
}

/// The frontend tier spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FrontendSpec {
    #[serde(flatten)]
    pub tier: TierSpec,
    /// An explicit, generation-tagged request to restore the cluster from a snapshot.
    #[serde(default)]
    pub disaster_recovery: Option<DisasterRecovery>,
}

/// A disaster recovery request.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisasterRecovery {
    #[serde(default)]
    pub enabled: bool,
    /// Increment to request a new recovery cycle.
    #[serde(default)]
    pub generation: i64,
}

/// The compute tier spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeSpec {
    #[serde(flatten)]
    pub tier: TierSpec,
    /// When set, the tier's replica count is owned by a horizontal autoscaler.
    #[serde(default)]
    pub auto_scaling_policy: Option<AutoScalingPolicy>,
}

/// A horizontal scaling policy for the compute tier.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoScalingPolicy {
    #[serde(default)]
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    /// The preferred autoscaler API variant.
    ///
    /// Platforms newer than 1.25 only serve `v2`, which is always used there. On 1.25 & older,
    /// `v2beta2` is used when unset, and a `v2` preference is honored from 1.23 onwards.
    #[serde(default)]
    pub version: Option<AutoscalerVersion>,
    /// Resource utilization targets. Only the first `cpu` target is used by the `V1` variant.
    #[serde(default)]
    pub metrics: Vec<ScalingMetric>,
    /// Scaling behavior. Ignored by the `V1` variant.
    #[serde(default)]
    pub behavior: Option<ScalingBehavior>,
}

/// The autoscaler API variants.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum AutoscalerVersion {
    V1,
    V2Beta2,
    V2,
}

impl AutoscalerVersion {
    /// The K8s API version of this variant.
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::V1 => "autoscaling/v1",
            Self::V2Beta2 => "autoscaling/v2beta2",
            Self::V2 => "autoscaling/v2",
        }
    }
}

/// A resource utilization scaling target.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingMetric {
    /// The resource name, `cpu` or `memory`.
    pub resource: String,
    /// Target average utilization, as a percentage of requests.
    pub average_utilization: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingBehavior {
    #[serde(default)]
    pub scale_up_stabilization_seconds: Option<i32>,
    #[serde(default)]
    pub scale_down_stabilization_seconds: Option<i32>,
}

/// The proxy tier spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(flatten)]
    pub tier: TierSpec,
    /// The DNS resolver used by the proxy.
    #[serde(default)]
    pub resolver: Option<String>,
}

/// Hooks to run around image upgrades.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePolicy {
    /// Hooks run, in order, before any tier is upgraded.
    #[serde(default)]
    pub pre_upgrade_hooks: Vec<Hook>,
    /// Hooks run, in order, once every tier runs its target image.
    #[serde(default)]
    pub post_upgrade_hooks: Vec<Hook>,
    /// The per-hook timeout.
    #[serde(default)]
    pub hook_timeout_seconds: Option<u64>,
    /// Use the built-in balancer disable/re-enable hooks where no hooks are declared.
    #[serde(default)]
    pub use_default_hooks: bool,
}

/// One idempotent administrative action.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    pub name: String,
    /// An administrative statement for `Sql` hooks, a shell script body for `Script` hooks.
    pub command: String,
    /// A failed critical hook aborts the enclosing upgrade phase.
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub kind: HookKind,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum HookKind {
    #[default]
    Sql,
    Script,
}
