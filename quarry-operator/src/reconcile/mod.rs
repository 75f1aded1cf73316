//! The convergence engine.
//!
//! One pass of the orchestrator drives a single cluster object towards its desired state: the
//! upgrade manager may gate the pass, the tier controllers then run in the order dictated by the
//! pass's scenario, and finally either the mutated spec or the aggregated status is written back.

mod apply;
mod autoscaler;
mod backend;
mod component;
mod compute;
mod frontend;
mod ordering;
mod proxy;
mod recovery;
mod status;
mod upgrade;
mod workload;

#[cfg(test)]
mod autoscaler_test;
#[cfg(test)]
mod upgrade_test;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::fingerprint::cluster_fingerprint;
use crate::hooks::HookRunner;
use crate::k8s::client::ClusterClient;
use crate::retry::{retry_on_conflict, RetryConfig};
use quarry_core::crd::{
    ClusterPhase, ClusterSpec, ClusterStatus, DisasterRecoveryStatus, HorizontalScalerRef, QuarryCluster, RequiredMetadata, UpgradePhase, UpgradeState,
};
use quarry_core::{Error, Result, TierKind};

use backend::BackendController;
use compute::ComputeController;
use frontend::FrontendController;
use ordering::{detect_scenario, order_for};
use proxy::ProxyController;
use upgrade::UpgradeManager;

/// The requeue delay of a running cluster.
const REQUEUE_RUNNING: Duration = Duration::from_secs(300);
/// The requeue delay of a cluster which is still converging.
const REQUEUE_PENDING: Duration = Duration::from_secs(15);
/// The requeue delay of a failed cluster.
const REQUEUE_FAILED: Duration = Duration::from_secs(30);
/// The requeue delay while the upgrade manager blocks forward convergence.
const REQUEUE_UPGRADE_BLOCKED: Duration = Duration::from_secs(10);
/// The requeue delay after the spec was written back.
const REQUEUE_SPEC_WRITTEN: Duration = Duration::from_secs(1);

/// The outcome of a successful pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing further to do until the object changes.
    Done,
    /// Run another pass after the given delay.
    Requeue(Duration),
}

/// State carried between the controllers of a single pass.
#[derive(Clone, Debug)]
pub struct Pass {
    /// The status of the cluster as observed at the start of the pass.
    pub previous: ClusterStatus,
    /// The disaster recovery state computed by the frontend controller.
    pub recovery: Option<DisasterRecoveryStatus>,
    /// The autoscaler reference computed by the compute controller.
    pub scaler: Option<HorizontalScalerRef>,
    /// Tiers whose sync was deferred until the frontend tier is reachable.
    pub waiting: BTreeSet<TierKind>,
}

impl Pass {
    pub fn new(previous: ClusterStatus) -> Self {
        Self {
            previous,
            recovery: None,
            scaler: None,
            waiting: BTreeSet::new(),
        }
    }
}

/// The contract of a tier controller.
#[async_trait]
pub trait ComponentController: Send + Sync {
    /// The tier driven by this controller.
    fn tier(&self) -> TierKind;

    /// Normalize the given spec the way `sync_cluster` would. Must be idempotent.
    fn normalize_spec(&self, _spec: &mut ClusterSpec) {}

    /// Converge the tier's children to the desired spec, tearing them down if the tier's spec is
    /// absent. May mutate the desired spec.
    async fn sync_cluster(&self, desired: &mut QuarryCluster, pass: &mut Pass) -> Result<()>;

    /// Write the tier's status record into the given status. The record is cleared once the
    /// tier's spec is absent & its children are gone.
    async fn update_cluster_status(&self, desired: &QuarryCluster, pass: &Pass, status: &mut ClusterStatus) -> Result<()>;

    /// Delete every child of the tier. Absent children are skipped.
    async fn clear_resources(&self, cluster: &QuarryCluster) -> Result<()>;
}

/// Drives convergence passes of cluster objects.
pub struct Orchestrator<C: ClusterClient> {
    client: Arc<C>,
    config: Arc<Config>,
    retry: RetryConfig,
    controllers: BTreeMap<TierKind, Box<dyn ComponentController>>,
    upgrades: UpgradeManager<C>,
}

impl<C: ClusterClient> Orchestrator<C> {
    pub fn new(client: Arc<C>, config: Arc<Config>, hooks: HookRunner) -> Self {
        let retry = RetryConfig::with_max_attempts(config.conflict_retry_attempts);
        let controllers: Vec<Box<dyn ComponentController>> = vec![
            Box::new(FrontendController::new(client.clone(), retry.clone())),
            Box::new(BackendController::new(client.clone(), retry.clone())),
            Box::new(ComputeController::new(client.clone(), retry.clone())),
            Box::new(ProxyController::new(client.clone(), retry.clone())),
        ];
        let controllers = controllers.into_iter().map(|controller| (controller.tier(), controller)).collect();
        Self {
            upgrades: UpgradeManager::new(client.clone(), config.clone(), hooks),
            client,
            config,
            retry,
            controllers,
        }
    }

    /// Run one convergence pass over the named cluster.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome> {
        let cluster: QuarryCluster = match self.client.get(namespace, name).await? {
            Some(cluster) => cluster,
            None => {
                tracing::debug!(namespace, name, "cluster no longer exists");
                return Ok(Outcome::Done);
            }
        };
        if cluster.is_ignored() || !self.config.is_namespace_allowed(namespace) {
            tracing::debug!(namespace, name, "skipping ignored cluster");
            return Ok(Outcome::Done);
        }
        let previous = cluster.status.clone().unwrap_or_default();
        if cluster.is_deleting() {
            // Children are garbage collected through their owner references.
            let status = ClusterStatus { phase: ClusterPhase::Deleting, ..previous };
            self.persist_status(&cluster, status).await?;
            return Ok(Outcome::Done);
        }

        let before = match cluster_fingerprint(&cluster) {
            Ok(fingerprint) => fingerprint,
            Err(err) => return Err(self.record_failure(&cluster, &previous, previous.upgrade_state.clone(), err).await),
        };
        let live = match workload::observe(self.client.as_ref(), namespace, name).await {
            Ok(live) => live,
            Err(err) => return Err(self.record_failure(&cluster, &previous, previous.upgrade_state.clone(), err).await),
        };
        let gate = match self.upgrades.evaluate(&cluster, &live).await {
            Ok(gate) => gate,
            Err(err) => return Err(self.record_failure(&cluster, &previous, previous.upgrade_state.clone(), err).await),
        };
        if gate.block {
            tracing::info!(namespace, name, "forward convergence blocked by upgrade preparation");
            let status = ClusterStatus { upgrade_state: gate.state, ..previous };
            self.persist_status(&cluster, status).await?;
            return Ok(Outcome::Requeue(REQUEUE_UPGRADE_BLOCKED));
        }

        let scenario = detect_scenario(previous.phase, &live, &cluster.spec);
        tracing::debug!(namespace, name, ?scenario, "running tier controllers");
        let mut desired = cluster.clone();
        let mut pass = Pass::new(previous.clone());
        for tier in order_for(scenario) {
            if let Err(err) = self.controller(tier)?.sync_cluster(&mut desired, &mut pass).await {
                tracing::error!(namespace, name, %tier, error = ?err, "error syncing tier");
                return Err(self.record_failure(&cluster, &previous, gate.state, err).await);
            }
        }

        // A controller mutated the spec; persist it before anything else.
        let changed = cluster_fingerprint(&desired).map(|after| after != before);
        match changed {
            Ok(false) => (),
            Ok(true) => match self.persist_spec(&cluster).await {
                Ok(()) => return Ok(Outcome::Requeue(REQUEUE_SPEC_WRITTEN)),
                Err(err) => return Err(self.record_failure(&cluster, &previous, gate.state, err).await),
            },
            Err(err) => return Err(self.record_failure(&cluster, &previous, gate.state, err).await),
        }

        let mut status = ClusterStatus {
            upgrade_state: gate.state.clone(),
            ..Default::default()
        };
        for tier in TierKind::ALL {
            if let Err(err) = self.controller(tier)?.update_cluster_status(&desired, &pass, &mut status).await {
                return Err(self.record_failure(&cluster, &previous, gate.state, err).await);
            }
        }
        status.phase = status.aggregate_phase();
        status.reason = status_reason(&status);
        let phase = status.phase;
        self.persist_status(&cluster, status).await?;

        Ok(Outcome::Requeue(match phase {
            ClusterPhase::Running => REQUEUE_RUNNING,
            ClusterPhase::Failed => REQUEUE_FAILED,
            ClusterPhase::Pending | ClusterPhase::Deleting => REQUEUE_PENDING,
        }))
    }

    fn controller(&self, tier: TierKind) -> Result<&dyn ComponentController> {
        self.controllers
            .get(&tier)
            .map(|controller| controller.as_ref())
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("no controller registered for tier {}", tier)))
    }

    /// Write the error's reason into the cluster's status, best-effort, returning the error.
    async fn record_failure(&self, cluster: &QuarryCluster, previous: &ClusterStatus, upgrade_state: Option<UpgradeState>, err: Error) -> Error {
        let status = ClusterStatus {
            reason: Some(err.to_string()),
            upgrade_state,
            ..previous.clone()
        };
        if let Err(status_err) = self.persist_status(cluster, status).await {
            tracing::warn!(error = ?status_err, "error recording reconcile failure in cluster status");
        }
        err
    }

    /// Re-apply every controller's spec normalization to the latest revision of the cluster &
    /// write it back if it changed.
    async fn persist_spec(&self, cluster: &QuarryCluster) -> Result<()> {
        let (namespace, name) = (cluster.namespace(), cluster.name());
        retry_on_conflict(&self.retry, "persist cluster spec", || async {
            let Some(mut latest) = self.client.get::<QuarryCluster>(namespace, name).await? else {
                return Ok(());
            };
            let original = latest.spec.clone();
            for controller in self.controllers.values() {
                controller.normalize_spec(&mut latest.spec);
            }
            if latest.spec == original {
                return Ok(());
            }
            self.client.replace(namespace, name, &latest).await?;
            tracing::info!(namespace, name, "persisted normalized cluster spec");
            Ok(())
        })
        .await
    }

    /// Write the given status onto the latest revision of the cluster, unless already current.
    async fn persist_status(&self, cluster: &QuarryCluster, status: ClusterStatus) -> Result<()> {
        let (namespace, name) = (cluster.namespace(), cluster.name());
        retry_on_conflict(&self.retry, "persist cluster status", || async {
            let Some(mut latest) = self.client.get::<QuarryCluster>(namespace, name).await? else {
                return Ok(());
            };
            if latest.status.as_ref() == Some(&status) {
                return Ok(());
            }
            latest.status = Some(status.clone());
            self.client.replace_status(namespace, name, &latest).await?;
            Ok(())
        })
        .await
    }
}

/// The reason surfaced on the cluster: a failed upgrade, else the first tier reporting one.
fn status_reason(status: &ClusterStatus) -> Option<String> {
    if let Some(state) = status.upgrade_state.as_ref().filter(|state| state.phase == UpgradePhase::Failed) {
        return state.reason.clone();
    }
    TierKind::ALL
        .iter()
        .filter_map(|tier| status.component(*tier).map(|component| (tier, component)))
        .find_map(|(tier, component)| component.reason.as_ref().map(|reason| format!("{}: {}", tier, reason)))
}
