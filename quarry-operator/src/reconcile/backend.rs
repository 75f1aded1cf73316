//! The backend (storage) tier controller.

use std::sync::Arc;

use async_trait::async_trait;

use super::component::TierBase;
use super::{ComponentController, Pass};
use crate::k8s::client::ClusterClient;
use crate::retry::RetryConfig;
use quarry_core::crd::{ClusterStatus, QuarryCluster};
use quarry_core::{Result, TierKind};

pub struct BackendController<C: ClusterClient> {
    base: TierBase<C>,
}

impl<C: ClusterClient> BackendController<C> {
    pub fn new(client: Arc<C>, retry: RetryConfig) -> Self {
        Self { base: TierBase::new(client, retry, TierKind::Backend) }
    }
}

#[async_trait]
impl<C: ClusterClient> ComponentController for BackendController<C> {
    fn tier(&self) -> TierKind {
        TierKind::Backend
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tier = "backend"))]
    async fn sync_cluster(&self, desired: &mut QuarryCluster, pass: &mut Pass) -> Result<()> {
        let desired: &QuarryCluster = desired;
        let Some(spec) = desired.spec.backend.as_ref() else {
            return self.clear_resources(desired).await;
        };
        if !self.base.sync_dependent(desired, spec, vec![]).await? {
            pass.waiting.insert(TierKind::Backend);
        }
        Ok(())
    }

    async fn update_cluster_status(&self, desired: &QuarryCluster, pass: &Pass, status: &mut ClusterStatus) -> Result<()> {
        status.backend = self.base.status(desired, pass.waiting.contains(&TierKind::Backend)).await?;
        Ok(())
    }

    async fn clear_resources(&self, cluster: &QuarryCluster) -> Result<()> {
        self.base.clear_resources(cluster).await
    }
}
