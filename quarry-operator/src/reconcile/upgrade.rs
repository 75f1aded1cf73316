//! The upgrade state machine.
//!
//! An upgrade cycle starts when a running cluster's desired images differ from its live images.
//! Pre-upgrade hooks run against the frontend tier before any workload is touched, and forward
//! convergence is blocked until they succeed. Once every tier runs its target image, the
//! post-upgrade hooks run on a best-effort basis.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::workload::{live_images, LiveWorkloads};
use crate::config::Config;
use crate::hooks::{default_post_upgrade_hooks, default_pre_upgrade_hooks, AdminTarget, HookPhase, HookRunner};
use crate::k8s::client::ClusterClient;
use crate::templates::FE_QUERY_PORT;
use crate::tierconfig;
use quarry_core::crd::{ClusterPhase, Hook, QuarryCluster, RequiredMetadata, UpgradePhase, UpgradeState};
use quarry_core::{Error, Result, TierKind, TierNames};

const METRIC_UPGRADE_TRANSITIONS: &str = "quarry_upgrade_phase_transitions_total";

/// The verdict of the upgrade manager for one pass.
#[derive(Clone, Debug, PartialEq)]
pub struct UpgradeGate {
    /// The upgrade state to persist.
    pub state: Option<UpgradeState>,
    /// Forward convergence must not run this pass.
    pub block: bool,
}

impl UpgradeGate {
    fn open(state: Option<UpgradeState>) -> Self {
        Self { state, block: false }
    }

    fn blocked(state: UpgradeState) -> Self {
        Self { state: Some(state), block: true }
    }
}

/// Drives the upgrade state machine of clusters.
pub struct UpgradeManager<C: ClusterClient> {
    client: Arc<C>,
    config: Arc<Config>,
    hooks: HookRunner,
}

impl<C: ClusterClient> UpgradeManager<C> {
    pub fn new(client: Arc<C>, config: Arc<Config>, hooks: HookRunner) -> Self {
        Self { client, config, hooks }
    }

    /// Evaluate the upgrade state of the given cluster against its live workloads, advancing the
    /// state machine by at most one step.
    #[tracing::instrument(level = "debug", skip_all, fields(cluster = cluster.name()))]
    pub async fn evaluate(&self, cluster: &QuarryCluster, live: &LiveWorkloads) -> Result<UpgradeGate> {
        let status = cluster.status.as_ref();
        let previous = status.and_then(|status| status.upgrade_state.clone());
        let desired = cluster.spec.desired_images();
        match previous {
            Some(state) if !state.phase.is_terminal() => self.advance(cluster, state, desired, live).await,
            Some(state) if state.target_version == desired => Ok(UpgradeGate::open(Some(state))),
            previous => {
                let running = status.map(|status| status.phase == ClusterPhase::Running).unwrap_or(false);
                let current = live_images(live);
                if !running || !has_skew(&desired, &current) {
                    return Ok(UpgradeGate::open(previous));
                }
                tracing::info!(cluster = cluster.name(), ?desired, ?current, "upgrade detected");
                let state = UpgradeState {
                    phase: UpgradePhase::Detected,
                    target_version: desired,
                    current_version: current,
                    hooks_executed: vec![],
                    reason: None,
                    start_time: Some(chrono::Utc::now().to_rfc3339()),
                    completion_time: None,
                };
                record_transition(UpgradePhase::Detected);
                Ok(UpgradeGate::blocked(state))
            }
        }
    }

    async fn advance(&self, cluster: &QuarryCluster, mut state: UpgradeState, desired: BTreeMap<String, String>, live: &LiveWorkloads) -> Result<UpgradeGate> {
        if state.target_version != desired {
            tracing::info!(cluster = cluster.name(), ?desired, "upgrade target changed mid-cycle");
            state.target_version = desired;
        }
        state.current_version = live_images(live);
        match state.phase {
            UpgradePhase::Detected | UpgradePhase::Preparing => self.prepare(cluster, state).await,
            UpgradePhase::Ready => {
                transition(&mut state, UpgradePhase::InProgress);
                Ok(UpgradeGate::open(Some(state)))
            }
            UpgradePhase::InProgress => {
                if !rollout_converged(cluster, &state, live) {
                    return Ok(UpgradeGate::open(Some(state)));
                }
                self.finish(cluster, state).await
            }
            UpgradePhase::Completed | UpgradePhase::Failed => Ok(UpgradeGate::open(Some(state))),
        }
    }

    /// Run the pre-upgrade hooks. An unreachable frontend keeps the cycle in `Preparing`.
    async fn prepare(&self, cluster: &QuarryCluster, mut state: UpgradeState) -> Result<UpgradeGate> {
        transition(&mut state, UpgradePhase::Preparing);
        let hooks = self.hooks_for(cluster, HookPhase::Pre);
        let target = self.admin_target(cluster).await?;
        let report = match self.hooks.run(HookPhase::Pre, &hooks, &target, self.hook_timeout(cluster)).await {
            Ok(report) => report,
            Err(Error::AdminChannel(reason)) => {
                tracing::warn!(cluster = cluster.name(), %target, %reason, "frontend not reachable for pre-upgrade hooks, will retry");
                state.reason = Some(format!("waiting for administrative channel: {}", reason));
                return Ok(UpgradeGate::blocked(state));
            }
            Err(err) => return Err(err),
        };
        record_executed(&mut state, report.executed.iter());
        if let Some(Error::HookFailed { hook, reason }) = report.critical_failure() {
            transition(&mut state, UpgradePhase::Failed);
            state.reason = Some(format!("critical pre-upgrade hook {} failed: {}", hook, reason));
            state.completion_time = Some(chrono::Utc::now().to_rfc3339());
            return Ok(UpgradeGate::open(Some(state)));
        }
        state.reason = report.failure_summary();
        transition(&mut state, UpgradePhase::Ready);
        Ok(UpgradeGate::open(Some(state)))
    }

    /// Run the post-upgrade hooks & complete the cycle. Hook failures are recorded, not fatal.
    async fn finish(&self, cluster: &QuarryCluster, mut state: UpgradeState) -> Result<UpgradeGate> {
        let hooks = self.hooks_for(cluster, HookPhase::Post);
        let target = self.admin_target(cluster).await?;
        let report = match self.hooks.run(HookPhase::Post, &hooks, &target, self.hook_timeout(cluster)).await {
            Ok(report) => report,
            Err(Error::AdminChannel(reason)) => {
                tracing::warn!(cluster = cluster.name(), %target, %reason, "frontend not reachable for post-upgrade hooks, will retry");
                state.reason = Some(format!("waiting for administrative channel: {}", reason));
                return Ok(UpgradeGate::open(Some(state)));
            }
            Err(err) => return Err(err),
        };
        record_executed(&mut state, report.executed.iter());
        state.reason = report.failure_summary();
        state.completion_time = Some(chrono::Utc::now().to_rfc3339());
        transition(&mut state, UpgradePhase::Completed);
        tracing::info!(cluster = cluster.name(), target = ?state.target_version, "upgrade completed");
        Ok(UpgradeGate::open(Some(state)))
    }

    /// The hooks of the given phase: those declared by the cluster's policy, or the built-in
    /// hooks if the policy opts into them & declares none.
    fn hooks_for(&self, cluster: &QuarryCluster, phase: HookPhase) -> Vec<Hook> {
        let Some(policy) = cluster.spec.upgrade_policy.as_ref() else {
            return vec![];
        };
        let (declared, defaults): (&Vec<Hook>, fn() -> Vec<Hook>) = match phase {
            HookPhase::Pre => (&policy.pre_upgrade_hooks, default_pre_upgrade_hooks),
            HookPhase::Post => (&policy.post_upgrade_hooks, default_post_upgrade_hooks),
        };
        if declared.is_empty() && policy.use_default_hooks {
            return defaults();
        }
        declared.clone()
    }

    fn hook_timeout(&self, cluster: &QuarryCluster) -> Duration {
        cluster
            .spec
            .upgrade_policy
            .as_ref()
            .and_then(|policy| policy.hook_timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.hook_timeout())
    }

    /// The administrative endpoint of the cluster's frontend tier.
    async fn admin_target(&self, cluster: &QuarryCluster) -> Result<AdminTarget> {
        let names = TierNames::new(cluster.name(), TierKind::Frontend);
        let reference = cluster.spec.frontend.as_ref().and_then(|spec| spec.tier.config_map_info.as_ref());
        let config = tierconfig::resolve(self.client.as_ref(), cluster.namespace(), reference).await?;
        let port = match config.get("query_port") {
            Some(_) => u16::try_from(config.port("query_port", FE_QUERY_PORT)).unwrap_or(self.config.admin_port),
            None => self.config.admin_port,
        };
        Ok(AdminTarget {
            host: format!("{}.{}", names.external_service, cluster.namespace()),
            port,
        })
    }
}

/// Check if any tier with a live workload runs an image other than its desired image.
fn has_skew(desired: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> bool {
    current.iter().any(|(tier, image)| desired.get(tier).map(|target| target != image).unwrap_or(false))
}

/// Check if every desired tier runs its target image & has finished rolling out.
fn rollout_converged(cluster: &QuarryCluster, state: &UpgradeState, live: &LiveWorkloads) -> bool {
    TierKind::ALL.iter().filter(|tier| cluster.spec.tier(**tier).is_some()).all(|tier| {
        let target = state.target_version.get(tier.short_name());
        match live.get(tier) {
            Some(workload) => workload.rollout_complete && workload.image.as_ref() == target,
            None => false,
        }
    })
}

fn record_executed<'a>(state: &mut UpgradeState, executed: impl Iterator<Item = &'a String>) {
    for hook in executed {
        if !state.hooks_executed.contains(hook) {
            state.hooks_executed.push(hook.clone());
        }
    }
}

fn transition(state: &mut UpgradeState, phase: UpgradePhase) {
    if state.phase == phase {
        return;
    }
    tracing::info!(from = state.phase.as_str(), to = phase.as_str(), "upgrade phase transition");
    state.phase = phase;
    record_transition(phase);
}

fn record_transition(phase: UpgradePhase) {
    metrics::increment_counter!(METRIC_UPGRADE_TRANSITIONS, "phase" => phase.as_str());
}
