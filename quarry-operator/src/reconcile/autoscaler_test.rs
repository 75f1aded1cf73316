use anyhow::Result;
use k8s_openapi::api::autoscaling::{v1, v2};

use super::autoscaler::{select_variant, AutoscalerAdapter};
use crate::fixtures::{self, FakeClient};
use crate::k8s::client::PlatformVersion;
use crate::retry::RetryConfig;
use quarry_core::crd::{AutoScalingPolicy, AutoscalerVersion, ScalingMetric};
use quarry_core::{TierKind, TierNames};

fn policy(max_replicas: i32) -> AutoScalingPolicy {
    AutoScalingPolicy {
        min_replicas: Some(1),
        max_replicas,
        metrics: vec![ScalingMetric { resource: "cpu".into(), average_utilization: 60 }],
        ..Default::default()
    }
}

#[test]
fn variant_selection_follows_platform_version() -> Result<()> {
    let old = PlatformVersion { major: 1, minor: 22 };
    let mid = PlatformVersion { major: 1, minor: 24 };
    let new = PlatformVersion { major: 1, minor: 27 };

    let cases = [
        (new, Some(AutoscalerVersion::V1), AutoscalerVersion::V2),
        (new, None, AutoscalerVersion::V2),
        (mid, Some(AutoscalerVersion::V1), AutoscalerVersion::V1),
        (mid, Some(AutoscalerVersion::V2), AutoscalerVersion::V2),
        (mid, None, AutoscalerVersion::V2Beta2),
        (old, Some(AutoscalerVersion::V2), AutoscalerVersion::V2Beta2),
    ];
    for (platform, preferred, expected) in cases {
        let selected = select_variant(&platform, preferred);
        assert!(selected == expected, "expected {:?} for {:?} & {:?} got {:?}", expected, platform, preferred, selected);
    }
    Ok(())
}

#[tokio::test]
async fn autoscaler_lifecycle() -> Result<()> {
    let client = FakeClient::new();
    let adapter = AutoscalerAdapter::new(client.clone(), RetryConfig::default());
    let cluster = fixtures::cluster("qc", "quarry/cn:v1");
    let names = TierNames::new("qc", TierKind::Compute);

    let scaler = adapter.reconcile(&cluster, &names, Some(&policy(5))).await?;
    assert!(
        scaler.as_ref().map(|scaler| scaler.version.as_str()) == Some("autoscaling/v2"),
        "expected v2 autoscaler ref got {:?}",
        scaler
    );
    let hpa = client.fetch::<v2::HorizontalPodAutoscaler>(&names.autoscaler);
    let max = hpa.as_ref().and_then(|hpa| hpa.spec.as_ref()).map(|spec| spec.max_replicas);
    assert!(max == Some(5), "expected max replicas 5 got {:?}", max);

    let writes = client.writes();
    adapter.reconcile(&cluster, &names, Some(&policy(5))).await?;
    assert!(client.writes() == writes, "expected unchanged policy to issue no writes");

    adapter.reconcile(&cluster, &names, Some(&policy(8))).await?;
    let max = client
        .fetch::<v2::HorizontalPodAutoscaler>(&names.autoscaler)
        .and_then(|hpa| hpa.spec)
        .map(|spec| spec.max_replicas);
    assert!(max == Some(8), "expected max replicas 8 got {:?}", max);

    let scaler = adapter.reconcile(&cluster, &names, None).await?;
    assert!(scaler.is_none(), "expected no autoscaler ref got {:?}", scaler);
    assert!(
        client.fetch::<v1::HorizontalPodAutoscaler>(&names.autoscaler).is_none(),
        "expected autoscaler to be deleted"
    );

    let writes = client.writes();
    adapter.reconcile(&cluster, &names, None).await?;
    assert!(client.writes() == writes, "expected deletion of an absent autoscaler to issue no writes");
    Ok(())
}

#[tokio::test]
async fn legacy_platform_gets_legacy_autoscaler() -> Result<()> {
    let client = FakeClient::new();
    client.set_version(1, 22);
    let adapter = AutoscalerAdapter::new(client.clone(), RetryConfig::default());
    let cluster = fixtures::cluster("qc", "quarry/cn:v1");
    let names = TierNames::new("qc", TierKind::Compute);

    let scaler = adapter.reconcile(&cluster, &names, Some(&policy(3))).await?;
    assert!(
        scaler.as_ref().map(|scaler| scaler.version.as_str()) == Some("autoscaling/v2beta2"),
        "expected v2beta2 autoscaler ref got {:?}",
        scaler
    );
    Ok(())
}
