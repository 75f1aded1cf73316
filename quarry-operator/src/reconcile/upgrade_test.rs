use anyhow::Result;

use super::upgrade::UpgradeManager;
use super::workload::{LiveWorkload, LiveWorkloads};
use crate::config::Config;
use crate::fixtures::{self, FakeClient, FakeConnector};
use crate::hooks::{default_post_upgrade_hooks, default_pre_upgrade_hooks};
use quarry_core::crd::{ClusterPhase, ClusterStatus, QuarryCluster, UpgradePhase, UpgradePolicy, UpgradeState};
use quarry_core::TierKind;

/// A running cluster whose tiers declare `image`, carrying the given upgrade state.
fn running_cluster(image: &str, state: Option<UpgradeState>) -> QuarryCluster {
    let mut cluster = fixtures::cluster("qc", image);
    cluster.spec.upgrade_policy = Some(UpgradePolicy { use_default_hooks: true, ..Default::default() });
    cluster.status = Some(ClusterStatus {
        phase: ClusterPhase::Running,
        upgrade_state: state,
        ..Default::default()
    });
    cluster
}

fn live(image: &str, rollout_complete: bool) -> LiveWorkloads {
    let workload = LiveWorkload { image: Some(image.into()), rollout_complete };
    maplit::btreemap! {
        TierKind::Frontend => workload.clone(),
        TierKind::Compute => workload,
    }
}

fn state(phase: UpgradePhase, target: &str) -> UpgradeState {
    UpgradeState {
        phase,
        target_version: maplit::btreemap! {
            "fe".to_string() => target.to_string(),
            "cn".to_string() => target.to_string(),
        },
        current_version: Default::default(),
        hooks_executed: vec![],
        reason: None,
        start_time: None,
        completion_time: None,
    }
}

fn manager(connector: std::sync::Arc<FakeConnector>) -> Result<UpgradeManager<FakeClient>> {
    Ok(UpgradeManager::new(FakeClient::new(), Config::new_test()?, fixtures::hook_runner(connector)))
}

fn statement(hooks: &[quarry_core::crd::Hook], name: &str) -> String {
    hooks.iter().find(|hook| hook.name == name).map(|hook| hook.command.clone()).unwrap_or_default()
}

#[tokio::test]
async fn image_skew_on_a_running_cluster_is_detected() -> Result<()> {
    let manager = manager(FakeConnector::new())?;
    let gate = manager.evaluate(&running_cluster("quarry:v2", None), &live("quarry:v1", true)).await?;

    let phase = gate.state.as_ref().map(|state| state.phase);
    assert!(phase == Some(UpgradePhase::Detected), "expected Detected got {:?}", phase);
    assert!(gate.block, "expected forward convergence to be blocked");
    let current = gate.state.as_ref().and_then(|state| state.current_version.get("fe").cloned());
    assert!(current.as_deref() == Some("quarry:v1"), "expected current fe version v1 got {:?}", current);
    Ok(())
}

#[tokio::test]
async fn no_skew_leaves_no_state() -> Result<()> {
    let manager = manager(FakeConnector::new())?;
    let gate = manager.evaluate(&running_cluster("quarry:v1", None), &live("quarry:v1", true)).await?;
    assert!(gate.state.is_none() && !gate.block, "expected no upgrade got {:?}", gate);

    let mut pending = running_cluster("quarry:v2", None);
    pending.status = None;
    let gate = manager.evaluate(&pending, &live("quarry:v1", true)).await?;
    assert!(gate.state.is_none() && !gate.block, "expected no upgrade of a pending cluster got {:?}", gate);
    Ok(())
}

#[tokio::test]
async fn pre_upgrade_hooks_make_the_upgrade_ready() -> Result<()> {
    let connector = FakeConnector::new();
    let manager = manager(connector.clone())?;
    let cluster = running_cluster("quarry:v2", Some(state(UpgradePhase::Detected, "quarry:v2")));
    let gate = manager.evaluate(&cluster, &live("quarry:v1", true)).await?;

    let state = gate.state.ok_or_else(|| anyhow::anyhow!("expected upgrade state"))?;
    assert!(state.phase == UpgradePhase::Ready, "expected Ready got {:?}", state.phase);
    assert!(!gate.block, "expected forward convergence to proceed");
    assert!(state.hooks_executed.len() == 3, "expected 3 executed hooks got {:?}", state.hooks_executed);
    assert!(connector.executed().len() == 3, "expected 3 executed statements got {:?}", connector.executed());
    Ok(())
}

#[tokio::test]
async fn critical_pre_upgrade_hook_failure_fails_the_upgrade() -> Result<()> {
    let connector = FakeConnector::new();
    connector.fail_statement(&statement(&default_pre_upgrade_hooks(), "disable-balance"));
    let manager = manager(connector.clone())?;
    let cluster = running_cluster("quarry:v2", Some(state(UpgradePhase::Detected, "quarry:v2")));
    let gate = manager.evaluate(&cluster, &live("quarry:v1", true)).await?;

    let state = gate.state.ok_or_else(|| anyhow::anyhow!("expected upgrade state"))?;
    assert!(state.phase == UpgradePhase::Failed, "expected Failed got {:?}", state.phase);
    assert!(
        !state.hooks_executed.contains(&"disable-balance".to_string()),
        "expected failed hook not to be recorded as executed, got {:?}",
        state.hooks_executed
    );
    assert!(
        state.hooks_executed == vec!["disable-tablet-scheduling".to_string()],
        "expected only the first hook to have run, got {:?}",
        state.hooks_executed
    );
    assert!(state.reason.is_some(), "expected a failure reason");
    assert!(state.completion_time.is_some(), "expected completion time to be set");
    Ok(())
}

#[tokio::test]
async fn unreachable_frontend_keeps_the_upgrade_preparing() -> Result<()> {
    let connector = FakeConnector::new();
    connector.set_unreachable(true);
    let manager = manager(connector.clone())?;
    let cluster = running_cluster("quarry:v2", Some(state(UpgradePhase::Detected, "quarry:v2")));
    let gate = manager.evaluate(&cluster, &live("quarry:v1", true)).await?;

    let phase = gate.state.as_ref().map(|state| state.phase);
    assert!(phase == Some(UpgradePhase::Preparing), "expected Preparing got {:?}", phase);
    assert!(gate.block, "expected forward convergence to stay blocked");
    Ok(())
}

#[tokio::test]
async fn session_lost_during_pre_upgrade_hooks_keeps_the_upgrade_preparing() -> Result<()> {
    let connector = FakeConnector::new();
    connector.drop_connection_on(&statement(&default_pre_upgrade_hooks(), "disable-balance"));
    let manager = manager(connector.clone())?;
    let cluster = running_cluster("quarry:v2", Some(state(UpgradePhase::Detected, "quarry:v2")));
    let gate = manager.evaluate(&cluster, &live("quarry:v1", true)).await?;

    let state = gate.state.ok_or_else(|| anyhow::anyhow!("expected upgrade state"))?;
    assert!(state.phase == UpgradePhase::Preparing, "expected Preparing got {:?}", state.phase);
    assert!(gate.block, "expected forward convergence to stay blocked");
    assert!(state.hooks_executed.is_empty(), "expected no hooks recorded for an interrupted run, got {:?}", state.hooks_executed);
    assert!(connector.executed().len() == 1, "expected one statement before the session was lost, got {:?}", connector.executed());
    Ok(())
}

#[tokio::test]
async fn ready_upgrade_proceeds_to_in_progress() -> Result<()> {
    let manager = manager(FakeConnector::new())?;
    let cluster = running_cluster("quarry:v2", Some(state(UpgradePhase::Ready, "quarry:v2")));
    let gate = manager.evaluate(&cluster, &live("quarry:v1", true)).await?;
    let phase = gate.state.as_ref().map(|state| state.phase);
    assert!(phase == Some(UpgradePhase::InProgress), "expected InProgress got {:?}", phase);
    assert!(!gate.block, "expected forward convergence to proceed");

    // Tiers still rolling.
    let cluster = running_cluster("quarry:v2", gate.state);
    let gate = manager.evaluate(&cluster, &live("quarry:v2", false)).await?;
    let phase = gate.state.as_ref().map(|state| state.phase);
    assert!(phase == Some(UpgradePhase::InProgress), "expected InProgress while rolling got {:?}", phase);
    Ok(())
}

#[tokio::test]
async fn non_critical_post_upgrade_hook_failure_still_completes() -> Result<()> {
    let connector = FakeConnector::new();
    connector.fail_statement(&statement(&default_post_upgrade_hooks(), "enable-balance"));
    let manager = manager(connector.clone())?;
    let cluster = running_cluster("quarry:v2", Some(state(UpgradePhase::InProgress, "quarry:v2")));
    let gate = manager.evaluate(&cluster, &live("quarry:v2", true)).await?;

    let state = gate.state.ok_or_else(|| anyhow::anyhow!("expected upgrade state"))?;
    assert!(state.phase == UpgradePhase::Completed, "expected Completed got {:?}", state.phase);
    assert!(state.hooks_executed.len() == 2, "expected 2 executed hooks got {:?}", state.hooks_executed);
    assert!(state.reason.is_some(), "expected hook failure to be surfaced");
    assert!(
        state.current_version == state.target_version,
        "expected current version {:?} to match target {:?}",
        state.current_version,
        state.target_version
    );

    // A completed cycle for the current target is left alone.
    let cluster = running_cluster("quarry:v2", Some(state));
    let gate = manager.evaluate(&cluster, &live("quarry:v2", true)).await?;
    let phase = gate.state.as_ref().map(|state| state.phase);
    assert!(phase == Some(UpgradePhase::Completed), "expected Completed to be retained got {:?}", phase);
    assert!(connector.executed().len() == 2, "expected no further hooks got {:?}", connector.executed());
    Ok(())
}
