//! The frontend (coordination) tier controller.

use std::sync::Arc;

use async_trait::async_trait;

use super::component::TierBase;
use super::recovery::{should_enter, DisasterRecoveryController};
use super::{ComponentController, Pass};
use crate::k8s::client::ClusterClient;
use crate::retry::RetryConfig;
use crate::templates::{TierTemplate, FE_QUERY_PORT};
use quarry_core::crd::{ClusterStatus, FrontendStatus, QuarryCluster};
use quarry_core::{Result, TierKind};

pub struct FrontendController<C: ClusterClient> {
    base: TierBase<C>,
    recovery: DisasterRecoveryController<C>,
}

impl<C: ClusterClient> FrontendController<C> {
    pub fn new(client: Arc<C>, retry: RetryConfig) -> Self {
        Self {
            recovery: DisasterRecoveryController::new(client.clone()),
            base: TierBase::new(client, retry, TierKind::Frontend),
        }
    }
}

#[async_trait]
impl<C: ClusterClient> ComponentController for FrontendController<C> {
    fn tier(&self) -> TierKind {
        TierKind::Frontend
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tier = "frontend"))]
    async fn sync_cluster(&self, desired: &mut QuarryCluster, pass: &mut Pass) -> Result<()> {
        let desired: &QuarryCluster = desired;
        let Some(spec) = desired.spec.frontend.as_ref() else {
            return self.clear_resources(desired).await;
        };

        let names = self.base.names(desired);
        let config = self.base.resolve_config(desired, &spec.tier).await?;
        let template = TierTemplate {
            cluster: desired,
            names: &names,
            spec: &spec.tier,
            config: &config,
            frontend: None,
            env: vec![],
        };
        self.base.apply_services(&template).await?;

        let previous = pass.previous.frontend.as_ref().and_then(|status| status.disaster_recovery_status.clone());
        let request = spec.disaster_recovery.as_ref().filter(|request| should_enter(config.is_shared_data(), Some(*request), previous.as_ref()));
        let Some(request) = request else {
            self.base.apply_workload(&template).await?;
            pass.recovery = previous;
            return Ok(());
        };

        // Restore mode replaces normal rendering for as long as the cycle is active.
        let query_port = config.port("query_port", FE_QUERY_PORT);
        let step = self
            .recovery
            .advance(desired, &spec.tier, request, previous.as_ref(), template.build_statefulset(), query_port)
            .await?;
        if let Some(workload) = step.workload {
            self.base.apply_statefulset(desired, workload).await?;
        }
        pass.recovery = Some(step.status);
        Ok(())
    }

    async fn update_cluster_status(&self, desired: &QuarryCluster, pass: &Pass, status: &mut ClusterStatus) -> Result<()> {
        status.frontend = self.base.status(desired, false).await?.map(|component| FrontendStatus {
            component,
            disaster_recovery_status: pass.recovery.clone(),
        });
        Ok(())
    }

    async fn clear_resources(&self, cluster: &QuarryCluster) -> Result<()> {
        self.base.clear_resources(cluster).await
    }
}
