//! The compute tier controller.
//!
//! When a scaling policy is present the autoscaler owns the replica count, so the explicit count
//! is cleared from the desired spec before rendering. The orchestrator notices the mutated spec &
//! persists it.

use std::sync::Arc;

use async_trait::async_trait;

use super::autoscaler::AutoscalerAdapter;
use super::component::TierBase;
use super::{ComponentController, Pass};
use crate::k8s::client::ClusterClient;
use crate::retry::RetryConfig;
use quarry_core::crd::{ClusterSpec, ClusterStatus, ComputeStatus, QuarryCluster, RequiredMetadata};
use quarry_core::{Result, TierKind};

pub struct ComputeController<C: ClusterClient> {
    base: TierBase<C>,
    autoscaler: AutoscalerAdapter<C>,
}

impl<C: ClusterClient> ComputeController<C> {
    pub fn new(client: Arc<C>, retry: RetryConfig) -> Self {
        Self {
            autoscaler: AutoscalerAdapter::new(client.clone(), retry.clone()),
            base: TierBase::new(client, retry, TierKind::Compute),
        }
    }
}

#[async_trait]
impl<C: ClusterClient> ComponentController for ComputeController<C> {
    fn tier(&self) -> TierKind {
        TierKind::Compute
    }

    fn normalize_spec(&self, spec: &mut ClusterSpec) {
        if let Some(compute) = spec.compute.as_mut() {
            if compute.auto_scaling_policy.is_some() {
                compute.tier.replicas = None;
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tier = "compute"))]
    async fn sync_cluster(&self, desired: &mut QuarryCluster, pass: &mut Pass) -> Result<()> {
        self.normalize_spec(&mut desired.spec);
        let desired: &QuarryCluster = desired;
        let Some(spec) = desired.spec.compute.as_ref() else {
            return self.clear_resources(desired).await;
        };
        if !self.base.sync_dependent(desired, &spec.tier, vec![]).await? {
            pass.waiting.insert(TierKind::Compute);
            pass.scaler = pass.previous.compute.as_ref().and_then(|status| status.horizontal_scaler.clone());
            return Ok(());
        }
        let names = self.base.names(desired);
        pass.scaler = self.autoscaler.reconcile(desired, &names, spec.auto_scaling_policy.as_ref()).await?;
        Ok(())
    }

    async fn update_cluster_status(&self, desired: &QuarryCluster, pass: &Pass, status: &mut ClusterStatus) -> Result<()> {
        status.compute = self
            .base
            .status(desired, pass.waiting.contains(&TierKind::Compute))
            .await?
            .map(|component| ComputeStatus { component, horizontal_scaler: pass.scaler.clone() });
        Ok(())
    }

    async fn clear_resources(&self, cluster: &QuarryCluster) -> Result<()> {
        self.base.clear_resources(cluster).await?;
        self.autoscaler.remove(cluster.namespace(), &self.base.names(cluster)).await?;
        Ok(())
    }
}
