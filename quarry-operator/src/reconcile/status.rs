//! Status aggregation.
//!
//! A tier's phase is derived from its instances & from the rollout signal of the workload which
//! owns them. Pod readiness alone is not enough: during a rolling update the old replicas stay
//! ready while the new ones are still arriving.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;

use crate::k8s::client::ClusterClient;
use quarry_core::crd::{ComponentPhase, ComponentStatus};
use quarry_core::{Result, TierNames, WorkloadKind};

/// Instances of a tier partitioned by lifecycle state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceTally {
    pub creating: Vec<String>,
    pub ready: Vec<String>,
    pub failed: Vec<String>,
    /// The reason reported by the first failed instance.
    pub failure_reason: Option<String>,
}

impl InstanceTally {
    /// Partition the given pods by lifecycle state.
    pub fn from_pods(pods: &[Pod]) -> Self {
        let mut tally = Self::default();
        for pod in pods {
            let name = pod.metadata.name.clone().unwrap_or_default();
            let status = pod.status.as_ref();
            match status.and_then(|status| status.phase.as_deref()) {
                Some("Failed") | Some("Unknown") => {
                    if tally.failure_reason.is_none() {
                        let reason = status
                            .and_then(|status| status.message.clone().or_else(|| status.reason.clone()))
                            .unwrap_or_else(|| format!("pod {} failed", name));
                        tally.failure_reason = Some(reason);
                    }
                    tally.failed.push(name);
                }
                Some("Running") if Self::containers_ready(pod) => tally.ready.push(name),
                Some("Succeeded") => continue,
                _ => tally.creating.push(name),
            }
        }
        tally.creating.sort();
        tally.ready.sort();
        tally.failed.sort();
        tally
    }

    fn containers_ready(pod: &Pod) -> bool {
        match pod.status.as_ref().and_then(|status| status.container_statuses.as_ref()) {
            Some(statuses) if !statuses.is_empty() => statuses.iter().all(|status| status.ready),
            _ => false,
        }
    }
}

/// Decide a tier's phase, in priority order: any failed instance, any creating instance, then
/// the workload's own rollout signal.
pub fn decide_phase(tally: &InstanceTally, rollout_complete: bool) -> (ComponentPhase, Option<String>) {
    if !tally.failed.is_empty() {
        return (ComponentPhase::Failed, tally.failure_reason.clone());
    }
    if !tally.creating.is_empty() {
        return (ComponentPhase::Reconciling, None);
    }
    if rollout_complete {
        (ComponentPhase::Running, None)
    } else {
        (ComponentPhase::Reconciling, Some("waiting for workload rollout to complete".into()))
    }
}

/// Check if a StatefulSet's rollout is complete.
pub fn statefulset_rollout_complete(sts: &StatefulSet) -> bool {
    let (Some(spec), Some(status)) = (sts.spec.as_ref(), sts.status.as_ref()) else {
        return false;
    };
    let desired = spec.replicas.unwrap_or(1);
    let generation = sts.metadata.generation.unwrap_or_default();
    status.observed_generation.unwrap_or_default() >= generation
        && status.replicas == desired
        && status.updated_replicas.unwrap_or_default() == desired
        && status.ready_replicas.unwrap_or_default() == desired
        && status.current_revision.is_some()
        && status.current_revision == status.update_revision
}

/// Check if a Deployment's rollout is complete.
pub fn deployment_rollout_complete(deployment: &Deployment) -> bool {
    let (Some(spec), Some(status)) = (deployment.spec.as_ref(), deployment.status.as_ref()) else {
        return false;
    };
    let desired = spec.replicas.unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or_default();
    status.observed_generation.unwrap_or_default() >= generation
        && status.replicas.unwrap_or_default() == desired
        && status.updated_replicas.unwrap_or_default() == desired
        && status.ready_replicas.unwrap_or_default() == desired
        && status.available_replicas.unwrap_or_default() == desired
}

/// Compute the status record of one tier from the live state of its instances & workload.
#[tracing::instrument(level = "debug", skip(client, names), fields(tier = %names.tier))]
pub async fn aggregate<C: ClusterClient>(client: &C, namespace: &str, names: &TierNames) -> Result<ComponentStatus> {
    let pods: Vec<Pod> = client.list(namespace, &names.label_selector()).await?;
    let tally = InstanceTally::from_pods(&pods);
    let rollout_complete = match names.tier.workload_kind() {
        WorkloadKind::StatefulSet => client
            .get::<StatefulSet>(namespace, &names.workload)
            .await?
            .map(|sts| statefulset_rollout_complete(&sts))
            .unwrap_or(false),
        WorkloadKind::Deployment => client
            .get::<Deployment>(namespace, &names.workload)
            .await?
            .map(|deployment| deployment_rollout_complete(&deployment))
            .unwrap_or(false),
    };
    let (phase, reason) = decide_phase(&tally, rollout_complete);
    Ok(ComponentStatus {
        phase,
        reason,
        service_name: names.external_service.clone(),
        resource_names: names.resource_names(),
        creating_instances: tally.creating,
        ready_instances: tally.ready,
        failed_instances: tally.failed,
    })
}
