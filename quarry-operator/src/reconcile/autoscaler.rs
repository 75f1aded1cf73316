//! Horizontal autoscaling of the compute tier.
//!
//! The abstract scaling policy is rendered into whichever autoscaler API variant the platform
//! serves. All variants are views of the same underlying object, so deletion always goes through
//! the `autoscaling/v1` view which every supported platform serves.

use std::sync::Arc;

use k8s_openapi::api::autoscaling::{v1, v2, v2beta2};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use crate::fingerprint::{autoscaler_fingerprint, Fingerprint};
use crate::k8s::client::{ClusterClient, Object, PlatformVersion};
use crate::reconcile::apply::{delete_if_present, Applied};
use crate::retry::{retry_on_conflict, RetryConfig};
use quarry_core::crd::{AutoScalingPolicy, AutoscalerVersion, HorizontalScalerRef, QuarryCluster, RequiredMetadata, ANNOTATION_AUTOSCALER_FINGERPRINT};
use quarry_core::{Result, TierNames};

/// Platforms above this minor version no longer serve `autoscaling/v2beta2`.
const NEWEST_ONLY_AFTER_MINOR: u32 = 25;
/// The first minor version serving `autoscaling/v2`.
const V2_SINCE_MINOR: u32 = 23;

/// Select the autoscaler API variant for the given platform version & preferred variant.
///
/// Above the threshold the newest variant is always used. Otherwise the preferred variant is
/// used where served, falling back to the legacy `v2beta2` shape.
pub fn select_variant(version: &PlatformVersion, preferred: Option<AutoscalerVersion>) -> AutoscalerVersion {
    if version.major > 1 || (version.major == 1 && version.minor > NEWEST_ONLY_AFTER_MINOR) {
        return AutoscalerVersion::V2;
    }
    match preferred {
        Some(AutoscalerVersion::V1) => AutoscalerVersion::V1,
        Some(AutoscalerVersion::V2) if version.minor >= V2_SINCE_MINOR => AutoscalerVersion::V2,
        _ => AutoscalerVersion::V2Beta2,
    }
}

/// Build the `autoscaling/v1` rendering of the given policy.
pub fn build_v1(meta: ObjectMeta, target: &str, policy: &AutoScalingPolicy) -> v1::HorizontalPodAutoscaler {
    let cpu = policy.metrics.iter().find(|metric| metric.resource == "cpu").map(|metric| metric.average_utilization);
    v1::HorizontalPodAutoscaler {
        metadata: meta,
        spec: Some(v1::HorizontalPodAutoscalerSpec {
            max_replicas: policy.max_replicas,
            min_replicas: policy.min_replicas,
            scale_target_ref: v1::CrossVersionObjectReference {
                api_version: Some("apps/v1".into()),
                kind: "StatefulSet".into(),
                name: target.into(),
            },
            target_cpu_utilization_percentage: cpu,
        }),
        ..Default::default()
    }
}

/// The `v2` & `v2beta2` shapes are identical, so their builders are generated from one body.
macro_rules! build_metrics_variant {
    ($name:ident, $api:ident) => {
        pub fn $name(meta: ObjectMeta, target: &str, policy: &AutoScalingPolicy) -> $api::HorizontalPodAutoscaler {
            let metrics = policy
                .metrics
                .iter()
                .map(|metric| $api::MetricSpec {
                    type_: "Resource".into(),
                    resource: Some($api::ResourceMetricSource {
                        name: metric.resource.clone(),
                        target: $api::MetricTarget {
                            type_: "Utilization".into(),
                            average_utilization: Some(metric.average_utilization),
                            ..Default::default()
                        },
                    }),
                    ..Default::default()
                })
                .collect::<Vec<_>>();
            let behavior = policy.behavior.as_ref().map(|behavior| $api::HorizontalPodAutoscalerBehavior {
                scale_up: behavior.scale_up_stabilization_seconds.map(|seconds| $api::HPAScalingRules {
                    stabilization_window_seconds: Some(seconds),
                    ..Default::default()
                }),
                scale_down: behavior.scale_down_stabilization_seconds.map(|seconds| $api::HPAScalingRules {
                    stabilization_window_seconds: Some(seconds),
                    ..Default::default()
                }),
            });
            $api::HorizontalPodAutoscaler {
                metadata: meta,
                spec: Some($api::HorizontalPodAutoscalerSpec {
                    max_replicas: policy.max_replicas,
                    min_replicas: policy.min_replicas,
                    scale_target_ref: $api::CrossVersionObjectReference {
                        api_version: Some("apps/v1".into()),
                        kind: "StatefulSet".into(),
                        name: target.into(),
                    },
                    metrics: if metrics.is_empty() { None } else { Some(metrics) },
                    behavior,
                }),
                ..Default::default()
            }
        }
    };
}

build_metrics_variant!(build_v2, v2);
build_metrics_variant!(build_v2beta2, v2beta2);

/// Converges the autoscaler object of the compute tier.
pub struct AutoscalerAdapter<C: ClusterClient> {
    client: Arc<C>,
    retry: RetryConfig,
}

impl<C: ClusterClient> AutoscalerAdapter<C> {
    pub fn new(client: Arc<C>, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Converge the autoscaler of the given tier to the given policy.
    ///
    /// With a policy, the autoscaler is created or replaced when its fingerprint differs. Without
    /// one, any existing autoscaler is deleted.
    #[tracing::instrument(level = "debug", skip(self, cluster, names, policy), fields(name = %names.autoscaler))]
    pub async fn reconcile(&self, cluster: &QuarryCluster, names: &TierNames, policy: Option<&AutoScalingPolicy>) -> Result<Option<HorizontalScalerRef>> {
        let namespace = cluster.namespace();
        let Some(policy) = policy else {
            self.remove(namespace, names).await?;
            return Ok(None);
        };

        let platform = self.client.server_version().await?;
        let variant = select_variant(&platform, policy.version);
        let fingerprint = autoscaler_fingerprint(variant, &names.workload, policy)?;
        let meta = ObjectMeta {
            name: Some(names.autoscaler.clone()),
            namespace: Some(namespace.into()),
            labels: Some(names.labels()),
            annotations: Some(maplit::btreemap! {
                ANNOTATION_AUTOSCALER_FINGERPRINT.to_string() => fingerprint.to_string(),
            }),
            owner_references: cluster.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        };
        let applied = match variant {
            AutoscalerVersion::V1 => self.apply(namespace, build_v1(meta, &names.workload, policy), fingerprint).await?,
            AutoscalerVersion::V2Beta2 => self.apply(namespace, build_v2beta2(meta, &names.workload, policy), fingerprint).await?,
            AutoscalerVersion::V2 => self.apply(namespace, build_v2(meta, &names.workload, policy), fingerprint).await?,
        };
        if applied != Applied::Unchanged {
            tracing::info!(variant = variant.api_version(), ?applied, "autoscaler converged");
        }
        Ok(Some(HorizontalScalerRef {
            name: names.autoscaler.clone(),
            version: variant.api_version().into(),
        }))
    }

    /// Delete the autoscaler of the given tier, if any.
    pub async fn remove(&self, namespace: &str, names: &TierNames) -> Result<bool> {
        delete_if_present::<C, v1::HorizontalPodAutoscaler>(self.client.as_ref(), namespace, &names.autoscaler).await
    }

    /// Create the given autoscaler, or replace the live one when its fingerprint differs.
    async fn apply<K: Object>(&self, namespace: &str, desired: K, fingerprint: Fingerprint) -> Result<Applied> {
        let name = desired.meta().name.clone().unwrap_or_default();
        let fingerprint = fingerprint.to_string();
        retry_on_conflict(&self.retry, &format!("apply autoscaler {}", name), || async {
            let live: Option<K> = self.client.get(namespace, &name).await?;
            let Some(live) = live else {
                self.client.create(namespace, &desired).await?;
                return Ok(Applied::Created);
            };
            let live_fingerprint = live.meta().annotations.as_ref().and_then(|annotations| annotations.get(ANNOTATION_AUTOSCALER_FINGERPRINT));
            if live_fingerprint == Some(&fingerprint) {
                return Ok(Applied::Unchanged);
            }
            let mut update = desired.clone();
            update.meta_mut().resource_version = live.meta().resource_version.clone();
            self.client.replace(namespace, &name, &update).await?;
            Ok(Applied::Updated)
        })
        .await
    }
}
