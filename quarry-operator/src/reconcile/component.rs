//! Convergence machinery shared by every tier controller.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Endpoints, EnvVar, Service};

use super::apply::{apply_object, delete_if_present, Applied};
use super::status::aggregate;
use crate::k8s::client::ClusterClient;
use crate::retry::RetryConfig;
use crate::templates::{FrontendAddress, TierTemplate};
use crate::tierconfig::{self, TierConfig};
use quarry_core::crd::{ComponentPhase, ComponentStatus, QuarryCluster, RequiredMetadata, TierSpec};
use quarry_core::{Result, TierKind, TierNames, WorkloadKind};

/// The shared state & operations of one tier's controller.
pub struct TierBase<C: ClusterClient> {
    pub client: Arc<C>,
    pub retry: RetryConfig,
    pub tier: TierKind,
}

impl<C: ClusterClient> TierBase<C> {
    pub fn new(client: Arc<C>, retry: RetryConfig, tier: TierKind) -> Self {
        Self { client, retry, tier }
    }

    pub fn names(&self, cluster: &QuarryCluster) -> TierNames {
        TierNames::new(cluster.name(), self.tier)
    }

    /// Check if the frontend tier is externally reachable: its service must have at least one
    /// ready backing instance.
    #[tracing::instrument(level = "debug", skip(self, cluster))]
    pub async fn frontend_reachable(&self, cluster: &QuarryCluster) -> Result<bool> {
        let names = TierNames::new(cluster.name(), TierKind::Frontend);
        let endpoints: Option<Endpoints> = self.client.get(cluster.namespace(), &names.external_service).await?;
        Ok(endpoints
            .and_then(|endpoints| endpoints.subsets)
            .map(|subsets| subsets.iter().any(|subset| subset.addresses.as_ref().map(|addrs| !addrs.is_empty()).unwrap_or(false)))
            .unwrap_or(false))
    }

    /// Resolve the properties of the given tier spec.
    pub async fn resolve_config(&self, cluster: &QuarryCluster, spec: &TierSpec) -> Result<TierConfig> {
        tierconfig::resolve(self.client.as_ref(), cluster.namespace(), spec.config_map_info.as_ref()).await
    }

    /// Resolve the address at which the frontend tier is reached.
    pub async fn resolve_frontend(&self, cluster: &QuarryCluster) -> Result<FrontendAddress> {
        let reference = cluster.spec.frontend.as_ref().and_then(|spec| spec.tier.config_map_info.as_ref());
        let config = tierconfig::resolve(self.client.as_ref(), cluster.namespace(), reference).await?;
        Ok(FrontendAddress::new(cluster, &config))
    }

    /// Apply the services of this tier.
    pub async fn apply_services(&self, template: &TierTemplate<'_>) -> Result<()> {
        let namespace = template.cluster.namespace();
        apply_object(self.client.as_ref(), &self.retry, namespace, template.build_external_service()).await?;
        if self.tier.has_internal_service() {
            apply_object(self.client.as_ref(), &self.retry, namespace, template.build_internal_service()).await?;
        }
        Ok(())
    }

    /// Apply the workload of this tier, rendered from the given template.
    pub async fn apply_workload(&self, template: &TierTemplate<'_>) -> Result<Applied> {
        let namespace = template.cluster.namespace();
        match self.tier.workload_kind() {
            WorkloadKind::StatefulSet => apply_object(self.client.as_ref(), &self.retry, namespace, template.build_statefulset()).await,
            WorkloadKind::Deployment => apply_object(self.client.as_ref(), &self.retry, namespace, template.build_deployment()).await,
        }
    }

    /// Apply an already rendered StatefulSet for this tier.
    pub async fn apply_statefulset(&self, cluster: &QuarryCluster, sts: StatefulSet) -> Result<Applied> {
        apply_object(self.client.as_ref(), &self.retry, cluster.namespace(), sts).await
    }

    /// Converge a tier which depends on the frontend tier.
    ///
    /// Returns `false` without acting while the frontend tier is not yet reachable.
    pub async fn sync_dependent(&self, cluster: &QuarryCluster, spec: &TierSpec, env: Vec<EnvVar>) -> Result<bool> {
        if !self.frontend_reachable(cluster).await? {
            tracing::debug!(tier = %self.tier, "frontend tier not yet reachable, deferring sync");
            return Ok(false);
        }
        let frontend = self.resolve_frontend(cluster).await?;
        let config = self.resolve_config(cluster, spec).await?;
        let names = self.names(cluster);
        let template = TierTemplate {
            cluster,
            names: &names,
            spec,
            config: &config,
            frontend: Some(&frontend),
            env,
        };
        self.apply_services(&template).await?;
        self.apply_workload(&template).await?;
        Ok(true)
    }

    /// Delete the workload & services owned by this tier. Absent objects are skipped.
    #[tracing::instrument(level = "debug", skip(self, cluster), fields(tier = %self.tier))]
    pub async fn clear_resources(&self, cluster: &QuarryCluster) -> Result<()> {
        let names = self.names(cluster);
        let namespace = cluster.namespace();
        let client = self.client.as_ref();
        match self.tier.workload_kind() {
            WorkloadKind::StatefulSet => delete_if_present::<C, StatefulSet>(client, namespace, &names.workload).await?,
            WorkloadKind::Deployment => delete_if_present::<C, Deployment>(client, namespace, &names.workload).await?,
        };
        delete_if_present::<C, Service>(client, namespace, &names.external_service).await?;
        if self.tier.has_internal_service() {
            delete_if_present::<C, Service>(client, namespace, &names.internal_service).await?;
        }
        Ok(())
    }

    /// The names of the objects of this tier which still exist.
    pub async fn remaining_resources(&self, cluster: &QuarryCluster) -> Result<Vec<String>> {
        let names = self.names(cluster);
        let namespace = cluster.namespace();
        let mut remaining = vec![];
        let workload_exists = match self.tier.workload_kind() {
            WorkloadKind::StatefulSet => self.client.get::<StatefulSet>(namespace, &names.workload).await?.is_some(),
            WorkloadKind::Deployment => self.client.get::<Deployment>(namespace, &names.workload).await?.is_some(),
        };
        if workload_exists {
            remaining.push(names.workload.clone());
        }
        for service in [&names.external_service, &names.internal_service] {
            if self.client.get::<Service>(namespace, service).await?.is_some() {
                remaining.push(service.clone());
            }
        }
        Ok(remaining)
    }

    /// Compute this tier's status record.
    ///
    /// With a spec, the record is aggregated from live state. Without one, a `Reconciling` record
    /// is kept until every owned object is gone, and only then is the record cleared.
    pub async fn status(&self, cluster: &QuarryCluster, waiting_on_frontend: bool) -> Result<Option<ComponentStatus>> {
        let names = self.names(cluster);
        if cluster.spec.tier(self.tier).is_some() {
            let mut status = aggregate(self.client.as_ref(), cluster.namespace(), &names).await?;
            if waiting_on_frontend && status.phase == ComponentPhase::Reconciling {
                status.reason = Some("waiting for the frontend service to become reachable".into());
            }
            return Ok(Some(status));
        }
        let remaining = self.remaining_resources(cluster).await?;
        if remaining.is_empty() {
            return Ok(None);
        }
        Ok(Some(ComponentStatus {
            phase: ComponentPhase::Reconciling,
            reason: Some("tearing down".into()),
            service_name: names.external_service.clone(),
            resource_names: remaining,
            ..Default::default()
        }))
    }
}
