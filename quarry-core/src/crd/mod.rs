//! Quarry CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod cluster;
mod status;

use kube::Resource;

pub use cluster::{
    AutoScalingPolicy, AutoscalerVersion, ClusterSpec, ComputeSpec, ConfigMapReference, DisasterRecovery, EnvVarSpec, FrontendSpec, Hook,
    HookKind, MountInfo, ProxySpec, QuarryCluster, ScalingBehavior, ScalingMetric, ServiceSpec, StorageVolume, TierResources, TierSpec,
    UpgradePolicy,
};
pub use status::{
    ClusterPhase, ClusterStatus, ComponentPhase, ComponentStatus, ComputeStatus, DisasterRecoveryPhase, DisasterRecoveryStatus, FrontendStatus,
    HorizontalScalerRef, UpgradePhase, UpgradeState,
};

/// Annotation which suppresses all reconciliation of the annotated cluster.
pub const ANNOTATION_IGNORE_RECONCILE: &str = "quarry.rs/ignore-reconcile";
/// Annotation stamped on every child object, carrying the fingerprint of its last applied form.
pub const ANNOTATION_LAST_APPLIED: &str = "quarry.rs/last-applied-fingerprint";
/// Annotation stamped on autoscaler objects, carrying the fingerprint of the applied policy.
pub const ANNOTATION_AUTOSCALER_FINGERPRINT: &str = "quarry.rs/autoscaler-fingerprint";

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for QuarryCluster {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl QuarryCluster {
    /// Check if this cluster carries the ignore-reconcile annotation.
    pub fn is_ignored(&self) -> bool {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_IGNORE_RECONCILE))
            .map(|val| val.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Check if deletion of this cluster has been requested.
    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}
