//! The proxy tier controller.

use std::sync::Arc;

use async_trait::async_trait;

use super::component::TierBase;
use super::{ComponentController, Pass};
use crate::k8s::client::ClusterClient;
use crate::retry::RetryConfig;
use crate::templates::value_env;
use quarry_core::crd::{ClusterStatus, QuarryCluster};
use quarry_core::{Result, TierKind};

/// The env var naming the DNS resolver used by the proxy.
const RESOLVER_ENV: &str = "PROXY_RESOLVER";

pub struct ProxyController<C: ClusterClient> {
    base: TierBase<C>,
}

impl<C: ClusterClient> ProxyController<C> {
    pub fn new(client: Arc<C>, retry: RetryConfig) -> Self {
        Self { base: TierBase::new(client, retry, TierKind::Proxy) }
    }
}

#[async_trait]
impl<C: ClusterClient> ComponentController for ProxyController<C> {
    fn tier(&self) -> TierKind {
        TierKind::Proxy
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tier = "proxy"))]
    async fn sync_cluster(&self, desired: &mut QuarryCluster, pass: &mut Pass) -> Result<()> {
        let desired: &QuarryCluster = desired;
        let Some(spec) = desired.spec.proxy.as_ref() else {
            return self.clear_resources(desired).await;
        };
        let env = spec.resolver.iter().map(|resolver| value_env(RESOLVER_ENV, resolver)).collect();
        if !self.base.sync_dependent(desired, &spec.tier, env).await? {
            pass.waiting.insert(TierKind::Proxy);
        }
        Ok(())
    }

    async fn update_cluster_status(&self, desired: &QuarryCluster, pass: &Pass, status: &mut ClusterStatus) -> Result<()> {
        status.proxy = self.base.status(desired, pass.waiting.contains(&TierKind::Proxy)).await?;
        Ok(())
    }

    async fn clear_resources(&self, cluster: &QuarryCluster) -> Result<()> {
        self.base.clear_resources(cluster).await
    }
}
