//! Engine-owned status of a QuarryCluster.
//!
//! Status is recomputed on every pass and is never trusted as input, save for the upgrade &
//! disaster recovery state machines which carry their cycle history here.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tier::TierKind;

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// The aggregate phase of the cluster.
    #[serde(default)]
    pub phase: ClusterPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<FrontendStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<ComponentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<ComputeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ComponentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_state: Option<UpgradeState>,
}

impl ClusterStatus {
    /// The shared portion of the given tier's status record.
    pub fn component(&self, kind: TierKind) -> Option<&ComponentStatus> {
        match kind {
            TierKind::Frontend => self.frontend.as_ref().map(|status| &status.component),
            TierKind::Backend => self.backend.as_ref(),
            TierKind::Compute => self.compute.as_ref().map(|status| &status.component),
            TierKind::Proxy => self.proxy.as_ref(),
        }
    }

    /// Derive the aggregate cluster phase from the tier records, scanned in canonical order.
    ///
    /// The first tier reporting `Reconciling` or `Failed` determines the phase.
    pub fn aggregate_phase(&self) -> ClusterPhase {
        for kind in TierKind::ALL.iter() {
            match self.component(*kind).map(|status| status.phase) {
                Some(ComponentPhase::Reconciling) => return ClusterPhase::Pending,
                Some(ComponentPhase::Failed) => return ClusterPhase::Failed,
                _ => continue,
            }
        }
        ClusterPhase::Running
    }
}

/// The aggregate phase of a cluster.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Running,
    Failed,
    Deleting,
}

/// The phase of one tier.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ComponentPhase {
    #[default]
    Reconciling,
    Failed,
    Running,
}

/// The status record of one tier.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default)]
    pub phase: ComponentPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The name of the tier's externally reachable service.
    #[serde(default)]
    pub service_name: String,
    /// The names of every object owned by the tier.
    #[serde(default)]
    pub resource_names: Vec<String>,
    #[serde(default)]
    pub creating_instances: Vec<String>,
    #[serde(default)]
    pub ready_instances: Vec<String>,
    #[serde(default)]
    pub failed_instances: Vec<String>,
}

/// The status record of the frontend tier.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FrontendStatus {
    #[serde(flatten)]
    pub component: ComponentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disaster_recovery_status: Option<DisasterRecoveryStatus>,
}

/// The status record of the compute tier.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeStatus {
    #[serde(flatten)]
    pub component: ComponentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_scaler: Option<HorizontalScalerRef>,
}

/// A reference to the autoscaler object managing the compute tier.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScalerRef {
    pub name: String,
    /// The API version of the autoscaler object.
    pub version: String,
}

/// The phases of the upgrade state machine.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum UpgradePhase {
    Detected,
    Preparing,
    Ready,
    InProgress,
    Completed,
    Failed,
}

impl UpgradePhase {
    /// Check if this phase ends a cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "Detected",
            Self::Preparing => "Preparing",
            Self::Ready => "Ready",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

/// The state of the current (or last) upgrade cycle.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeState {
    pub phase: UpgradePhase,
    /// The desired image of each tier, keyed by tier short name.
    #[serde(default)]
    pub target_version: BTreeMap<String, String>,
    /// The live image of each tier when the cycle started, keyed by tier short name.
    #[serde(default)]
    pub current_version: BTreeMap<String, String>,
    /// Names of hooks which completed successfully, in execution order.
    #[serde(default)]
    pub hooks_executed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
}

/// The phases of the disaster recovery state machine.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum DisasterRecoveryPhase {
    #[default]
    Todo,
    Doing,
    Done,
}

/// The state of the current (or last) disaster recovery cycle.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisasterRecoveryStatus {
    #[serde(default)]
    pub phase: DisasterRecoveryPhase,
    /// The generation of the last completed cycle.
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_phase_first_unready_tier_wins() {
        let mut status = ClusterStatus::default();
        assert_eq!(status.aggregate_phase(), ClusterPhase::Running);

        status.frontend = Some(FrontendStatus {
            component: ComponentStatus { phase: ComponentPhase::Running, ..Default::default() },
            ..Default::default()
        });
        status.backend = Some(ComponentStatus { phase: ComponentPhase::Reconciling, ..Default::default() });
        status.proxy = Some(ComponentStatus { phase: ComponentPhase::Failed, ..Default::default() });
        assert_eq!(status.aggregate_phase(), ClusterPhase::Pending);

        status.backend = None;
        assert_eq!(status.aggregate_phase(), ClusterPhase::Failed);
    }

    #[test]
    fn status_serializes_camel_case_with_flattened_extensions() {
        let status = ClusterStatus {
            compute: Some(ComputeStatus {
                component: ComponentStatus { service_name: "c-cn-service".into(), ..Default::default() },
                horizontal_scaler: Some(HorizontalScalerRef { name: "c-cn-autoscaler".into(), version: "autoscaling/v2".into() }),
            }),
            ..Default::default()
        };
        let val = serde_json::to_value(&status).expect("error serializing status");
        assert_eq!(val["compute"]["serviceName"], "c-cn-service");
        assert_eq!(val["compute"]["horizontalScaler"]["version"], "autoscaling/v2");
        assert!(val.get("frontend").is_none(), "expected absent frontend record, got {:?}", val.get("frontend"));
    }
}
