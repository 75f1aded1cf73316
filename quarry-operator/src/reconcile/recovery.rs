//! Disaster recovery of the frontend tier.
//!
//! A recovery cycle is armed by supplying a generation greater than the last observed one. While a
//! cycle is active the frontend workload is rendered in restore mode: a single instance, no startup
//! or liveness probes, a bare port-open readiness check & restore markers in its environment.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};

use crate::k8s::client::ClusterClient;
use crate::templates::{tcp_probe, value_env};
use quarry_core::crd::{DisasterRecovery, DisasterRecoveryPhase, DisasterRecoveryStatus, QuarryCluster, RequiredMetadata, TierSpec};
use quarry_core::{Result, TierKind, TierNames};

/// The env var carrying the generation of the active recovery cycle.
pub const RESTORE_GENERATION_ENV: &str = "RESTORE_CLUSTER_GENERATION";
/// The env var switching the frontend process into restore mode.
pub const RESTORE_SNAPSHOT_ENV: &str = "RESTORE_CLUSTER_SNAPSHOT";
/// The file name of the recovery manifest which must be mounted into the frontend tier.
pub const SNAPSHOT_KEY: &str = "cluster_snapshot.yaml";

/// Check if a recovery cycle should be driven for the given request.
pub fn should_enter(shared_data: bool, request: Option<&DisasterRecovery>, previous: Option<&DisasterRecoveryStatus>) -> bool {
    let Some(request) = request.filter(|request| shared_data && request.enabled) else {
        return false;
    };
    let (observed, phase) = previous.map(|status| (status.observed_generation, status.phase)).unwrap_or((0, DisasterRecoveryPhase::Todo));
    request.generation > observed || (request.generation == observed && phase != DisasterRecoveryPhase::Done)
}

/// Rewrite the given frontend StatefulSet into its restore-mode shape.
pub fn rewrite_for_recovery(sts: &mut StatefulSet, generation: i64, query_port: i32) {
    let Some(spec) = sts.spec.as_mut() else {
        return;
    };
    spec.replicas = Some(1);
    let Some(pod_spec) = spec.template.spec.as_mut() else {
        return;
    };
    for container in pod_spec.containers.iter_mut().filter(|container| container.name == TierKind::Frontend.short_name()) {
        container.startup_probe = None;
        container.liveness_probe = None;
        container.readiness_probe = Some(tcp_probe(query_port));
        let env = container.env.get_or_insert_with(Vec::new);
        env.retain(|var| var.name != RESTORE_GENERATION_ENV && var.name != RESTORE_SNAPSHOT_ENV);
        env.push(value_env(RESTORE_GENERATION_ENV, &generation.to_string()));
        env.push(value_env(RESTORE_SNAPSHOT_ENV, "true"));
    }
}

/// Check if every given frontend instance runs the given generation's restore & is ready.
pub fn recovery_complete(pods: &[Pod], generation: i64) -> bool {
    let expected = generation.to_string();
    let carries_marker = |pod: &Pod| {
        pod.spec.iter().flat_map(|spec| spec.containers.iter()).any(|container| {
            container
                .env
                .iter()
                .flatten()
                .any(|var| var.name == RESTORE_GENERATION_ENV && var.value.as_deref() == Some(expected.as_str()))
        })
    };
    let ready = |pod: &Pod| match pod.status.as_ref().and_then(|status| status.container_statuses.as_ref()) {
        Some(statuses) if !statuses.is_empty() => statuses.iter().all(|status| status.ready),
        _ => false,
    };
    !pods.is_empty() && pods.iter().all(|pod| carries_marker(pod) && ready(pod))
}

/// The result of advancing a recovery cycle by one pass.
#[derive(Clone, Debug)]
pub struct RecoveryStep {
    pub status: DisasterRecoveryStatus,
    /// The restore-mode workload to apply. `None` while the cycle's precondition is unmet.
    pub workload: Option<StatefulSet>,
}

/// Drives the disaster recovery state machine of the frontend tier.
pub struct DisasterRecoveryController<C: ClusterClient> {
    client: Arc<C>,
}

impl<C: ClusterClient> DisasterRecoveryController<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Advance the recovery cycle of the given cluster by one pass.
    ///
    /// `workload` is the normally rendered frontend StatefulSet, which is rewritten into restore
    /// mode once the recovery manifest is found to be mounted.
    #[tracing::instrument(level = "debug", skip_all, fields(generation = request.generation))]
    pub async fn advance(
        &self, cluster: &QuarryCluster, spec: &TierSpec, request: &DisasterRecovery, previous: Option<&DisasterRecoveryStatus>, mut workload: StatefulSet,
        query_port: i32,
    ) -> Result<RecoveryStep> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut status = match previous {
            Some(previous) if previous.phase != DisasterRecoveryPhase::Done => previous.clone(),
            _ => DisasterRecoveryStatus {
                phase: DisasterRecoveryPhase::Todo,
                observed_generation: previous.map(|previous| previous.observed_generation).unwrap_or(0),
                start_timestamp: Some(now.clone()),
                ..Default::default()
            },
        };

        match status.phase {
            DisasterRecoveryPhase::Todo => {
                if !self.snapshot_mounted(cluster.namespace(), spec).await? {
                    tracing::warn!(cluster = cluster.name(), "recovery manifest {} is not mounted into the frontend tier", SNAPSHOT_KEY);
                    status.reason = Some(format!("recovery manifest {} is not mounted", SNAPSHOT_KEY));
                    return Ok(RecoveryStep { status, workload: None });
                }
                rewrite_for_recovery(&mut workload, request.generation, query_port);
                status.phase = DisasterRecoveryPhase::Doing;
                status.reason = None;
                tracing::info!(cluster = cluster.name(), generation = request.generation, "disaster recovery started");
            }
            DisasterRecoveryPhase::Doing => {
                rewrite_for_recovery(&mut workload, request.generation, query_port);
                let names = TierNames::new(cluster.name(), TierKind::Frontend);
                let pods: Vec<Pod> = self.client.list(cluster.namespace(), &names.label_selector()).await?;
                if recovery_complete(&pods, request.generation) {
                    status.phase = DisasterRecoveryPhase::Done;
                    status.observed_generation = request.generation;
                    status.end_timestamp = Some(now);
                    tracing::info!(cluster = cluster.name(), generation = request.generation, "disaster recovery completed");
                }
            }
            DisasterRecoveryPhase::Done => (),
        }
        Ok(RecoveryStep { status, workload: Some(workload) })
    }

    /// Check if the recovery manifest is mounted through any of the tier's config maps or secrets.
    async fn snapshot_mounted(&self, namespace: &str, spec: &TierSpec) -> Result<bool> {
        for mount in spec.config_maps.iter() {
            if mount.sub_path.as_deref() == Some(SNAPSHOT_KEY) {
                return Ok(true);
            }
            let config_map: Option<ConfigMap> = self.client.get(namespace, &mount.name).await?;
            if config_map.and_then(|config_map| config_map.data).map(|data| data.contains_key(SNAPSHOT_KEY)).unwrap_or(false) {
                return Ok(true);
            }
        }
        for mount in spec.secrets.iter() {
            if mount.sub_path.as_deref() == Some(SNAPSHOT_KEY) {
                return Ok(true);
            }
            let secret: Option<Secret> = self.client.get(namespace, &mount.name).await?;
            if secret.and_then(|secret| secret.data).map(|data| data.contains_key(SNAPSHOT_KEY)).unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
