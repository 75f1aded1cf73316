//! Change-gated application of child objects.
//!
//! An update call is only made when the newly rendered object differs from the live one. The
//! comparison is semantic: it uses the fingerprint stamped on the live object when it was last
//! applied plus the few fields which other actors are known to drift, never a raw comparison
//! against server-populated state.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;

use crate::fingerprint::Fingerprinted;
use crate::k8s::client::{ClusterClient, Object};
use crate::reconcile::workload::tier_image;
use crate::retry::{retry_on_conflict, RetryConfig};
use quarry_core::{Result, TierKind};

/// The outcome of applying an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// A child object kind which the engine converges.
pub trait Converge: Object + Fingerprinted {
    /// Check if the live object already matches this desired object.
    fn semantic_eq(&self, live: &Self) -> bool {
        self.last_applied().is_some() && self.last_applied() == live.last_applied()
    }

    /// Carry server-owned & externally-owned fields of the live object over to this object
    /// before it replaces the live one.
    fn prepare_update(&mut self, live: &Self) {
        self.meta_mut().resource_version = live.meta().resource_version.clone();
    }
}

impl Converge for StatefulSet {
    fn semantic_eq(&self, live: &Self) -> bool {
        let desired_spec = self.spec.as_ref();
        let live_spec = live.spec.as_ref();
        let replicas_match = match desired_spec.and_then(|spec| spec.replicas) {
            Some(replicas) => live_spec.and_then(|spec| spec.replicas) == Some(replicas),
            None => true,
        };
        let image_of = |spec: Option<&k8s_openapi::api::apps::v1::StatefulSetSpec>| {
            let containers = spec.and_then(|spec| spec.template.spec.as_ref()).map(|spec| &spec.containers);
            containers.map(|containers| containers.iter().map(|c| c.image.clone()).collect::<Vec<_>>())
        };
        self.last_applied().is_some() && self.last_applied() == live.last_applied() && replicas_match && image_of(desired_spec) == image_of(live_spec)
    }

    fn prepare_update(&mut self, live: &Self) {
        self.metadata.resource_version = live.metadata.resource_version.clone();
        if let Some(spec) = self.spec.as_mut() {
            if spec.replicas.is_none() {
                spec.replicas = live.spec.as_ref().and_then(|spec| spec.replicas);
            }
        }
    }
}

impl Converge for Deployment {
    fn semantic_eq(&self, live: &Self) -> bool {
        let desired_spec = self.spec.as_ref();
        let live_spec = live.spec.as_ref();
        let replicas_match = match desired_spec.and_then(|spec| spec.replicas) {
            Some(replicas) => live_spec.and_then(|spec| spec.replicas) == Some(replicas),
            None => true,
        };
        let desired_image = tier_image(TierKind::Proxy, desired_spec.and_then(|spec| spec.template.spec.as_ref()));
        let live_image = tier_image(TierKind::Proxy, live_spec.and_then(|spec| spec.template.spec.as_ref()));
        self.last_applied().is_some() && self.last_applied() == live.last_applied() && replicas_match && desired_image == live_image
    }

    fn prepare_update(&mut self, live: &Self) {
        self.metadata.resource_version = live.metadata.resource_version.clone();
        if let Some(spec) = self.spec.as_mut() {
            if spec.replicas.is_none() {
                spec.replicas = live.spec.as_ref().and_then(|spec| spec.replicas);
            }
        }
    }
}

impl Converge for Service {
    fn prepare_update(&mut self, live: &Self) {
        self.metadata.resource_version = live.metadata.resource_version.clone();
        let live_spec = live.spec.as_ref();
        if let Some(spec) = self.spec.as_mut() {
            if spec.cluster_ip.is_none() {
                spec.cluster_ip = live_spec.and_then(|spec| spec.cluster_ip.clone());
                spec.cluster_ips = live_spec.and_then(|spec| spec.cluster_ips.clone());
            }
            // Allocated node ports must be retained, or the update is rejected.
            if let (Some(ports), Some(live_ports)) = (spec.ports.as_mut(), live_spec.and_then(|spec| spec.ports.as_ref())) {
                for port in ports.iter_mut().filter(|port| port.node_port.is_none()) {
                    port.node_port = live_ports.iter().find(|live| live.name == port.name).and_then(|live| live.node_port);
                }
            }
        }
    }
}

/// Apply the given desired object: create it if absent, replace it if it differs, else no-op.
///
/// The object is stamped with its fingerprint before comparison. Replacement is a
/// read-modify-write cycle retried on conflict.
#[tracing::instrument(level = "debug", skip(client, retry, desired), fields(kind = %K::kind(&()), name = ?desired.meta().name))]
pub async fn apply_object<C, K>(client: &C, retry: &RetryConfig, namespace: &str, mut desired: K) -> Result<Applied>
where
    C: ClusterClient,
    K: Converge,
{
    desired.stamp()?;
    let name = desired.meta().name.clone().unwrap_or_default();
    let op_name = format!("apply {} {}", K::kind(&()), name);
    retry_on_conflict(retry, &op_name, || async {
        let live: Option<K> = client.get(namespace, &name).await?;
        match live {
            None => {
                client.create(namespace, &desired).await?;
                tracing::info!(kind = %K::kind(&()), %name, "created object");
                Ok(Applied::Created)
            }
            Some(live) if desired.semantic_eq(&live) => Ok(Applied::Unchanged),
            Some(live) => {
                let mut update = desired.clone();
                update.prepare_update(&live);
                client.replace(namespace, &name, &update).await?;
                tracing::info!(kind = %K::kind(&()), %name, "updated object");
                Ok(Applied::Updated)
            }
        }
    })
    .await
}

/// Delete the named object if it exists. Absence is success.
#[tracing::instrument(level = "debug", skip(client), fields(kind = %K::kind(&())))]
pub async fn delete_if_present<C, K>(client: &C, namespace: &str, name: &str) -> Result<bool>
where
    C: ClusterClient,
    K: Object,
{
    if client.get::<K>(namespace, name).await?.is_none() {
        return Ok(false);
    }
    client.delete::<K>(namespace, name).await?;
    tracing::info!(kind = %K::kind(&()), %name, "deleted object");
    Ok(true)
}
