//! Observation of the live workloads backing each tier.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodSpec;

use super::status::{deployment_rollout_complete, statefulset_rollout_complete};
use crate::k8s::client::ClusterClient;
use quarry_core::{Result, TierKind, TierNames, WorkloadKind};

/// The observed state of one tier's workload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiveWorkload {
    /// The image of the tier's main container in the workload template.
    pub image: Option<String>,
    pub rollout_complete: bool,
}

/// The observed workloads of a cluster, keyed by tier. Absent tiers have no live workload.
pub type LiveWorkloads = BTreeMap<TierKind, LiveWorkload>;

/// The image of the tier's main container within the given pod spec.
pub fn tier_image(tier: TierKind, spec: Option<&PodSpec>) -> Option<String> {
    let containers = &spec?.containers;
    containers
        .iter()
        .find(|container| container.name == tier.short_name())
        .or_else(|| containers.first())
        .and_then(|container| container.image.clone())
}

/// Observe the live workload of every tier of the named cluster.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn observe<C: ClusterClient>(client: &C, namespace: &str, cluster: &str) -> Result<LiveWorkloads> {
    let mut live = LiveWorkloads::new();
    for tier in TierKind::ALL {
        let names = TierNames::new(cluster, tier);
        let observed = match tier.workload_kind() {
            WorkloadKind::StatefulSet => client.get::<StatefulSet>(namespace, &names.workload).await?.map(|sts| LiveWorkload {
                image: tier_image(tier, sts.spec.as_ref().and_then(|spec| spec.template.spec.as_ref())),
                rollout_complete: statefulset_rollout_complete(&sts),
            }),
            WorkloadKind::Deployment => client.get::<Deployment>(namespace, &names.workload).await?.map(|deployment| LiveWorkload {
                image: tier_image(tier, deployment.spec.as_ref().and_then(|spec| spec.template.spec.as_ref())),
                rollout_complete: deployment_rollout_complete(&deployment),
            }),
        };
        if let Some(observed) = observed {
            live.insert(tier, observed);
        }
    }
    Ok(live)
}

/// The live image of every tier which has a live workload, keyed by tier short name.
pub fn live_images(live: &LiveWorkloads) -> BTreeMap<String, String> {
    live.iter()
        .filter_map(|(tier, workload)| workload.image.clone().map(|image| (tier.short_name().to_string(), image)))
        .collect()
}
