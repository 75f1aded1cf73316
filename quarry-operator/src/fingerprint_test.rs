use anyhow::Result;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use maplit::btreemap;

use crate::fingerprint::{cluster_fingerprint, Fingerprinted};
use crate::fixtures;
use quarry_core::crd::{ANNOTATION_IGNORE_RECONCILE, ANNOTATION_LAST_APPLIED};

#[test]
fn cluster_fingerprint_ignores_status() -> Result<()> {
    let cluster = fixtures::cluster("prod", "A");
    let mut with_status = cluster.clone();
    with_status.status = Some(Default::default());
    with_status.metadata.resource_version = Some("42".into());

    let (a, b) = (cluster_fingerprint(&cluster)?, cluster_fingerprint(&with_status)?);
    assert!(a == b, "expected fingerprints to match, got {} and {}", a, b);

    Ok(())
}

#[test]
fn cluster_fingerprint_tracks_spec_and_annotations() -> Result<()> {
    let cluster = fixtures::cluster("prod", "A");
    let base = cluster_fingerprint(&cluster)?;

    let mut replicas_cleared = cluster.clone();
    if let Some(compute) = replicas_cleared.spec.compute.as_mut() {
        compute.tier.replicas = None;
    }
    let cleared = cluster_fingerprint(&replicas_cleared)?;
    assert!(base != cleared, "expected spec mutation to change fingerprint, got {} for both", base);

    let mut annotated = cluster.clone();
    annotated.metadata.annotations = Some(btreemap! {ANNOTATION_IGNORE_RECONCILE.to_string() => "true".to_string()});
    let annotated = cluster_fingerprint(&annotated)?;
    assert!(base != annotated, "expected annotation change to change fingerprint, got {} for both", base);

    Ok(())
}

#[test]
fn service_fingerprint_excludes_allocated_fields() -> Result<()> {
    let desired = Service {
        metadata: ObjectMeta {
            name: Some("prod-fe-service".into()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            ports: Some(vec![ServicePort { name: Some("query".into()), port: 9030, ..Default::default() }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut live = desired.clone();
    live.metadata.resource_version = Some("7".into());
    if let Some(spec) = live.spec.as_mut() {
        spec.cluster_ip = Some("10.0.0.12".into());
        spec.cluster_ips = Some(vec!["10.0.0.12".into()]);
    }

    assert!(desired.fingerprint()? == live.fingerprint()?, "expected allocated IPs to be excluded from the fingerprint");

    Ok(())
}

#[test]
fn stamp_is_stable_across_restamping() -> Result<()> {
    let mut service = Service {
        metadata: ObjectMeta { name: Some("prod-fe-search".into()), ..Default::default() },
        ..Default::default()
    };
    service.stamp()?;
    let first = service.last_applied().map(String::from);
    service.stamp()?;
    let second = service.last_applied().map(String::from);

    assert!(first.is_some(), "expected {} annotation to be stamped", ANNOTATION_LAST_APPLIED);
    assert!(first == second, "expected restamping to be stable, got {:?} then {:?}", first, second);

    Ok(())
}
