//! Structural change detection.
//!
//! A fingerprint is a seahash digest over an explicit, versioned list of fields of an entity.
//! Fields are rendered through `serde_json::Value` whose maps are ordered, giving a canonical
//! byte form which does not depend on struct layout.

use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::Resource;
use serde_json::{json, Value};

use quarry_core::crd::{AutoScalingPolicy, AutoscalerVersion, QuarryCluster, ANNOTATION_LAST_APPLIED};
use quarry_core::Result;

/// The version of the field lists used below. Bump whenever a field list changes.
const FINGERPRINT_VERSION: u32 = 1;

/// An opaque structural digest. Equality implies that no write is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Compute the fingerprint of the given set of fields.
fn digest(kind: &str, fields: Value) -> Result<Fingerprint> {
    let canonical = serde_json::to_vec(&json!({
        "version": FINGERPRINT_VERSION,
        "kind": kind,
        "fields": fields,
    }))?;
    Ok(Fingerprint(seahash::hash(&canonical)))
}

/// Compute the fingerprint of a cluster's mutable identity & spec.
///
/// Fields: name, namespace, labels, annotations, spec. Status & server-populated metadata are
/// excluded.
pub fn cluster_fingerprint(cluster: &QuarryCluster) -> Result<Fingerprint> {
    let meta = cluster.meta();
    digest(
        "QuarryCluster",
        json!({
            "name": meta.name,
            "namespace": meta.namespace,
            "labels": meta.labels,
            "annotations": meta.annotations,
            "spec": serde_json::to_value(&cluster.spec)?,
        }),
    )
}

/// Compute the fingerprint of an autoscaler rendering.
///
/// Fields: API variant, scale target, minReplicas, maxReplicas, metrics, behavior.
pub fn autoscaler_fingerprint(variant: AutoscalerVersion, target: &str, policy: &AutoScalingPolicy) -> Result<Fingerprint> {
    digest(
        "HorizontalPodAutoscaler",
        json!({
            "variant": variant.api_version(),
            "target": target,
            "minReplicas": policy.min_replicas,
            "maxReplicas": policy.max_replicas,
            "metrics": serde_json::to_value(&policy.metrics)?,
            "behavior": serde_json::to_value(&policy.behavior)?,
        }),
    )
}

/// A child object kind with an explicit list of fields which the engine owns.
pub trait Fingerprinted: Resource<DynamicType = ()> {
    /// The engine-owned fields of this object.
    fn owned_fields(&self) -> Result<Value>;

    /// Compute the fingerprint of this object's engine-owned fields.
    fn fingerprint(&self) -> Result<Fingerprint> {
        let meta = self.meta();
        let mut annotations = meta.annotations.clone().unwrap_or_default();
        annotations.remove(ANNOTATION_LAST_APPLIED);
        digest(
            &Self::kind(&()),
            json!({
                "name": meta.name,
                "labels": meta.labels,
                "annotations": annotations,
                "ownerReferences": meta.owner_references,
                "owned": self.owned_fields()?,
            }),
        )
    }

    /// Stamp this object with the fingerprint of its current form.
    fn stamp(&mut self) -> Result<()> {
        let fingerprint = self.fingerprint()?;
        self.meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_LAST_APPLIED.into(), fingerprint.to_string());
        Ok(())
    }

    /// The fingerprint stamped on this object when it was last applied, if any.
    fn last_applied(&self) -> Option<&str> {
        self.meta().annotations.as_ref().and_then(|annotations| annotations.get(ANNOTATION_LAST_APPLIED)).map(String::as_str)
    }
}

impl Fingerprinted for StatefulSet {
    /// Fields: spec.
    fn owned_fields(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.spec)?)
    }
}

impl Fingerprinted for Deployment {
    /// Fields: spec.
    fn owned_fields(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.spec)?)
    }
}

impl Fingerprinted for Service {
    /// Fields: spec.type, spec.ports, spec.selector, spec.clusterIP when headless,
    /// spec.publishNotReadyAddresses. Allocated IPs & node ports are server-populated.
    fn owned_fields(&self) -> Result<Value> {
        let spec = self.spec.clone().unwrap_or_default();
        let headless = spec.cluster_ip.as_deref() == Some("None");
        Ok(json!({
            "type": spec.type_,
            "ports": serde_json::to_value(&spec.ports)?,
            "selector": spec.selector,
            "headless": headless,
            "publishNotReadyAddresses": spec.publish_not_ready_addresses,
        }))
    }
}
