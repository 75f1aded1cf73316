//! The closed set of tiers managed within a Quarry cluster.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label carrying the owning cluster's name.
pub const LABEL_CLUSTER: &str = "app.kubernetes.io/instance";
/// Label carrying the tier's short name.
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
/// Label identifying objects written by the operator.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Label joining a tier's pods to the workload which owns them.
pub const LABEL_OWNER_REFERENCE: &str = "quarry.rs/owner-reference";

/// One of the four managed workload roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TierKind {
    /// The metadata/coordination tier.
    Frontend,
    /// The storage tier.
    Backend,
    /// The elastic compute tier.
    Compute,
    /// The stateless proxy in front of the frontend tier.
    Proxy,
}

/// The kind of workload object which backs a tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    StatefulSet,
    Deployment,
}

impl TierKind {
    /// All tiers, in their canonical (status priority) order.
    pub const ALL: [TierKind; 4] = [TierKind::Frontend, TierKind::Backend, TierKind::Compute, TierKind::Proxy];

    /// The short name of this tier, used in object names, labels and version maps.
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Frontend => "fe",
            Self::Backend => "be",
            Self::Compute => "cn",
            Self::Proxy => "fe-proxy",
        }
    }

    /// The kind of workload which backs this tier.
    pub fn workload_kind(&self) -> WorkloadKind {
        match self {
            Self::Proxy => WorkloadKind::Deployment,
            _ => WorkloadKind::StatefulSet,
        }
    }

    /// Whether this tier exposes an internal headless service in addition to its external one.
    pub fn has_internal_service(&self) -> bool {
        !matches!(self, Self::Proxy)
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Compute => "compute",
            Self::Proxy => "proxy",
        })
    }
}

/// The canonical names of every object owned by one tier of one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierNames {
    pub cluster: String,
    pub tier: TierKind,
    /// The StatefulSet or Deployment.
    pub workload: String,
    /// The externally reachable service.
    pub external_service: String,
    /// The headless service used for stable pod identity.
    pub internal_service: String,
    /// The horizontal autoscaler (compute tier only).
    pub autoscaler: String,
}

impl TierNames {
    pub fn new(cluster: &str, tier: TierKind) -> Self {
        let base = format!("{}-{}", cluster, tier.short_name());
        Self {
            cluster: cluster.to_string(),
            tier,
            external_service: format!("{}-service", base),
            internal_service: format!("{}-search", base),
            autoscaler: format!("{}-autoscaler", base),
            workload: base,
        }
    }

    /// The labels used to select this tier's pods.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CLUSTER.into(), self.cluster.clone());
        labels.insert(LABEL_COMPONENT.into(), self.tier.short_name().into());
        labels.insert(LABEL_OWNER_REFERENCE.into(), self.workload.clone());
        labels
    }

    /// The full set of canonical labels stamped on every object of this tier.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(LABEL_MANAGED_BY.into(), crate::OPERATOR_NAME.into());
        labels
    }

    /// The selector labels rendered as a list-call label selector.
    pub fn label_selector(&self) -> String {
        self.selector_labels()
            .iter()
            .map(|(key, val)| format!("{}={}", key, val))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The names of every object which may be owned by this tier.
    pub fn resource_names(&self) -> Vec<String> {
        let mut names = vec![self.workload.clone(), self.external_service.clone()];
        if self.tier.has_internal_service() {
            names.push(self.internal_service.clone());
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_names_follow_canonical_scheme() {
        let names = TierNames::new("prod", TierKind::Compute);
        assert_eq!(names.workload, "prod-cn");
        assert_eq!(names.external_service, "prod-cn-service");
        assert_eq!(names.internal_service, "prod-cn-search");
        assert_eq!(names.autoscaler, "prod-cn-autoscaler");
        assert_eq!(
            names.label_selector(),
            "app.kubernetes.io/component=cn,app.kubernetes.io/instance=prod,quarry.rs/owner-reference=prod-cn"
        );
    }

    #[test]
    fn proxy_tier_has_no_internal_service() {
        let names = TierNames::new("prod", TierKind::Proxy);
        assert_eq!(names.resource_names(), vec!["prod-fe-proxy".to_string(), "prod-fe-proxy-service".to_string()]);
        assert_eq!(TierKind::Proxy.workload_kind(), WorkloadKind::Deployment);
    }
}
